//! Contracts between the codec and the messaging layer.
//!
//! The codec never owns messages; it reads what it needs through these
//! traits and writes results back. `ContactRecord`, `OutMessage`,
//! `InMessage` and `InAttachment` are plain owned implementations.

use std::path::{Path, PathBuf};

use crate::contact_cache::ContactKeyCache;
use crate::status::CoderStatus;

/// A correspondent as stored by the messaging layer.
pub trait Contact {
    fn address(&self) -> &str;
    /// Raw public keyring bytes; empty if none is known.
    fn public_key(&self) -> &[u8];
    /// Declared fingerprint of `public_key`.
    fn fingerprint(&self) -> &str;
}

pub trait OutgoingMessage {
    fn recipients(&self) -> Vec<&dyn Contact>;
    fn text(&self) -> &str;
    fn coder_status_mut(&mut self) -> &mut CoderStatus;
}

pub trait IncomingMessage {
    fn sender(&self) -> &dyn Contact;
    /// Ciphertext as received, kept after decryption for re-verification.
    fn encrypted_content(&self) -> Option<&[u8]>;
    fn coder_status(&self) -> &CoderStatus;
    fn coder_status_mut(&mut self) -> &mut CoderStatus;
    fn set_decrypted_content(&mut self, content: DecryptedContent);
}

pub trait EncryptedAttachment {
    fn encrypted_file(&self) -> &Path;
    fn coder_status(&self) -> &CoderStatus;
    fn coder_status_mut(&mut self) -> &mut CoderStatus;
    fn set_decrypted_file(&mut self, path: PathBuf);
}

/// Result of decrypting a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedContent {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Envelope sender, if the payload carried one.
    pub from: Option<String>,
    /// Envelope recipients.
    pub to: Vec<String>,
}

impl DecryptedContent {
    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactRecord {
    pub address: String,
    pub public_key: Vec<u8>,
    pub fingerprint: String,
}

impl ContactRecord {
    /// Record with the fingerprint computed from `public_key`.
    pub fn new(address: impl Into<String>, public_key: Vec<u8>) -> Self {
        let fingerprint = ContactKeyCache::fingerprint_of(&public_key).unwrap_or_default();
        Self {
            address: address.into(),
            public_key,
            fingerprint,
        }
    }

    /// Record for a correspondent whose key is not known.
    pub fn without_key(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

impl Contact for ContactRecord {
    fn address(&self) -> &str {
        &self.address
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[derive(Debug, Clone)]
pub struct OutMessage {
    pub recipients: Vec<ContactRecord>,
    pub text: String,
    pub status: CoderStatus,
}

impl OutMessage {
    pub fn new(recipients: Vec<ContactRecord>, text: impl Into<String>) -> Self {
        Self {
            recipients,
            text: text.into(),
            status: CoderStatus::plain(),
        }
    }
}

impl OutgoingMessage for OutMessage {
    fn recipients(&self) -> Vec<&dyn Contact> {
        self.recipients.iter().map(|c| c as &dyn Contact).collect()
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn coder_status_mut(&mut self) -> &mut CoderStatus {
        &mut self.status
    }
}

#[derive(Debug, Clone)]
pub struct InMessage {
    pub sender: ContactRecord,
    pub encrypted: Option<Vec<u8>>,
    pub status: CoderStatus,
    pub content: Option<DecryptedContent>,
}

impl InMessage {
    /// A received ciphertext, not yet decrypted.
    pub fn encrypted(sender: ContactRecord, ciphertext: Vec<u8>) -> Self {
        Self {
            sender,
            encrypted: Some(ciphertext),
            status: CoderStatus::received(true),
            content: None,
        }
    }
}

impl IncomingMessage for InMessage {
    fn sender(&self) -> &dyn Contact {
        &self.sender
    }

    fn encrypted_content(&self) -> Option<&[u8]> {
        self.encrypted.as_deref()
    }

    fn coder_status(&self) -> &CoderStatus {
        &self.status
    }

    fn coder_status_mut(&mut self) -> &mut CoderStatus {
        &mut self.status
    }

    fn set_decrypted_content(&mut self, content: DecryptedContent) {
        self.content = Some(content);
    }
}

#[derive(Debug, Clone)]
pub struct InAttachment {
    pub file: PathBuf,
    pub status: CoderStatus,
    pub decrypted_file: Option<PathBuf>,
}

impl InAttachment {
    /// A downloaded encrypted file.
    pub fn encrypted(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            status: CoderStatus::received(true),
            decrypted_file: None,
        }
    }
}

impl EncryptedAttachment for InAttachment {
    fn encrypted_file(&self) -> &Path {
        &self.file
    }

    fn coder_status(&self) -> &CoderStatus {
        &self.status
    }

    fn coder_status_mut(&mut self) -> &mut CoderStatus {
        &mut self.status
    }

    fn set_decrypted_file(&mut self, path: PathBuf) {
        self.decrypted_file = Some(path);
    }
}
