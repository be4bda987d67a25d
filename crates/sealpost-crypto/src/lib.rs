//! `Sealpost` E2E Encryption Library
//!
//! OpenPGP end-to-end encryption for chat messages and file attachments.
//!
//! ## Building blocks
//!
//! - **Account**: the user's secret keyring on disk, imported once and
//!   re-protected under a generated or user-chosen passphrase
//! - **Personal key**: authentication primary key, signing and encryption
//!   subkeys, plus an X.509 bridge certificate for TLS client login
//! - **Contact key cache**: parsed correspondent keys, invalidated by
//!   fingerprint
//! - **Coder**: sign-then-encrypt and decrypt-then-verify for messages,
//!   stanzas and attachments, recording outcomes in a [`CoderStatus`]

pub mod account;
pub mod bridge;
pub mod codec;
pub mod contact_cache;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod message;
pub mod personal;
pub mod status;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use account::Account;
pub use bridge::BridgeError;
pub use codec::{Coder, is_encrypted_file};
pub use contact_cache::ContactKeyCache;
pub use envelope::{Envelope, EnvelopeError};
pub use error::{AccountError, AccountErrorKind};
pub use keys::{ContactPublicKey, UserId};
pub use message::{
    Contact, ContactRecord, DecryptedContent, EncryptedAttachment, InAttachment, InMessage,
    IncomingMessage, OutMessage, OutgoingMessage,
};
pub use personal::PersonalKey;
pub use status::{CoderError, CoderStatus, Encryption, ErrorSet, Signing};
