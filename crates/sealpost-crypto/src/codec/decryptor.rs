//! Decrypt-then-verify, with failure classification.
//!
//! The backend reports failures as opaque errors. To map them onto the
//! per-message taxonomy the decryptor records how far it got (did one of
//! our keys unwrap a session key?) and pre-scans the packet layout, which
//! tells apart garbage, legacy unprotected data and messages not addressed
//! to us.
//!
//! The backend does not process legacy Symmetrically Encrypted Data
//! packets. Those are decrypted here (OpenPGP CFB with resync) and the
//! inner message is handed back to the backend for verification.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::path::Path;

use openpgp::Packet;
use openpgp::cert::prelude::*;
use openpgp::crypto::SessionKey;
use openpgp::crypto::symmetric::{self, BlockCipherMode, UnpaddingMode};
use openpgp::packet::{PKESK, SKESK, Tag};
use openpgp::parse::buffered_reader::{self, BufferedReader};
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, MessageLayer, MessageStructure, VerificationError,
    VerificationHelper,
};
use openpgp::parse::{Cookie, PacketParser, PacketParserResult, Parse};
use openpgp::types::SymmetricAlgorithm;
use openpgp::{KeyHandle, Result as PgpResult};
use sequoia_openpgp as openpgp;

use crate::keys::{self, ContactPublicKey};
use crate::personal::PersonalKey;
use crate::status::CoderError;

/// Why a decryption attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecryptFailure {
    InvalidData,
    InvalidPrivateKey,
    InvalidIntegrity,
}

impl DecryptFailure {
    pub(crate) const fn error(self) -> CoderError {
        match self {
            Self::InvalidData => CoderError::InvalidData,
            Self::InvalidPrivateKey => CoderError::InvalidPrivateKey,
            Self::InvalidIntegrity => CoderError::InvalidIntegrity,
        }
    }
}

/// Aggregate verdict over all signatures of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SignatureOutcome {
    Unsigned,
    /// Signed, but the sender's key is not available.
    SignerUnknown,
    Malformed,
    Invalid,
    Verified,
}

/// A successful decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Decrypted {
    pub(crate) signature: SignatureOutcome,
    /// False for legacy data carrying no modification detection code.
    pub(crate) integrity_protected: bool,
}

/// Top-level packet layout of a ciphertext.
#[derive(Debug, Default, Clone, Copy)]
struct Layout {
    has_pkesk: bool,
    /// Integrity-protected container.
    has_seip: bool,
    /// Legacy container without integrity protection.
    has_sed: bool,
}

impl Layout {
    fn scan(ppr: PgpResult<PacketParserResult<'_>>) -> Self {
        let mut layout = Self::default();
        let Ok(mut ppr) = ppr else {
            return layout;
        };
        while let PacketParserResult::Some(pp) = ppr {
            match pp.packet.tag() {
                Tag::PKESK => layout.has_pkesk = true,
                Tag::SEIP => {
                    layout.has_seip = true;
                    break;
                }
                Tag::SED => {
                    layout.has_sed = true;
                    break;
                }
                _ => {}
            }
            ppr = match pp.next() {
                Ok((_, next)) => next,
                Err(_) => break,
            };
        }
        layout
    }

    /// Once one of our keys unwrapped a session key, any later failure
    /// means the encrypted container itself is damaged.
    const fn classify(self, session_key_recovered: bool) -> DecryptFailure {
        if session_key_recovered {
            DecryptFailure::InvalidIntegrity
        } else if self.has_seip || self.has_sed || self.has_pkesk {
            DecryptFailure::InvalidPrivateKey
        } else {
            DecryptFailure::InvalidData
        }
    }
}

/// Progress shared with the helper; survives the helper being consumed by
/// a failing decryptor.
#[derive(Debug, Default)]
struct Progress {
    session_key_recovered: Cell<bool>,
    encrypted: Cell<bool>,
    signature: Cell<Option<SignatureOutcome>>,
}

struct Helper<'a> {
    my_key: &'a PersonalKey,
    sender: Option<&'a ContactPublicKey>,
    progress: &'a Progress,
}

impl Helper<'_> {
    fn record_signature(&self, outcome: SignatureOutcome) {
        let merged = self
            .progress
            .signature
            .get()
            .map_or(outcome, |prev| prev.max(outcome));
        self.progress.signature.set(Some(merged));
    }
}

impl VerificationHelper for Helper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> PgpResult<Vec<Cert>> {
        Ok(self
            .sender
            .map(|sender| vec![sender.cert().clone()])
            .unwrap_or_default())
    }

    fn check(&mut self, structure: MessageStructure) -> PgpResult<()> {
        for layer in structure.into_iter() {
            match layer {
                MessageLayer::Encryption { .. } => self.progress.encrypted.set(true),
                MessageLayer::SignatureGroup { results } => {
                    for result in results {
                        let outcome = match result {
                            Ok(_) => SignatureOutcome::Verified,
                            Err(VerificationError::MissingKey { .. }) if self.sender.is_none() => {
                                SignatureOutcome::SignerUnknown
                            }
                            Err(VerificationError::MalformedSignature { error, .. }) => {
                                tracing::debug!(%error, "Malformed signature");
                                SignatureOutcome::Malformed
                            }
                            Err(VerificationError::UnknownSignature { .. }) => {
                                tracing::debug!("Unparseable signature packet");
                                SignatureOutcome::Malformed
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Signature does not verify");
                                SignatureOutcome::Invalid
                            }
                        };
                        self.record_signature(outcome);
                    }
                }
                _ => {}
            }
        }
        if self.progress.encrypted.get() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("message is not encrypted"))
        }
    }
}

impl DecryptionHelper for Helper<'_> {
    fn decrypt(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
    ) -> PgpResult<Option<Cert>> {
        let mut keypair = self.my_key.decryptor()?;
        for pkesk in pkesks {
            let Some((algo, sk)) = pkesk.decrypt(&mut keypair, sym_algo) else {
                continue;
            };
            self.progress.session_key_recovered.set(true);
            if decrypt(algo, &sk) {
                return Ok(None);
            }
            tracing::debug!("Session key rejected by the encrypted container");
        }
        Err(openpgp::Error::MissingSessionKey("no session key for our key".into()).into())
    }
}

/// Decrypt and verify `ciphertext`, writing the plaintext to `output`.
///
/// `output` may receive partial plaintext before a failure is detected;
/// callers discard it on `Err`.
pub(crate) fn decrypt_bytes(
    my_key: &PersonalKey,
    sender: Option<&ContactPublicKey>,
    ciphertext: &[u8],
    buffer_size: usize,
    output: &mut dyn Write,
) -> Result<Decrypted, DecryptFailure> {
    let layout = Layout::scan(PacketParser::from_bytes(ciphertext));
    let progress = Progress::default();
    let builder = if layout.has_sed {
        legacy_plaintext(PacketParser::from_bytes(ciphertext), my_key, &progress)
            .and_then(DecryptorBuilder::from_buffered_reader)
    } else {
        DecryptorBuilder::from_bytes(ciphertext)
    };
    run(builder, layout, &progress, my_key, sender, buffer_size, output)
}

/// Same as [`decrypt_bytes`] for a file, streamed.
pub(crate) fn decrypt_file(
    my_key: &PersonalKey,
    sender: Option<&ContactPublicKey>,
    path: &Path,
    buffer_size: usize,
    output: &mut dyn Write,
) -> Result<Decrypted, DecryptFailure> {
    let layout = Layout::scan(PacketParser::from_file(path));
    let progress = Progress::default();
    let builder = if layout.has_sed {
        legacy_plaintext(PacketParser::from_file(path), my_key, &progress)
            .and_then(DecryptorBuilder::from_buffered_reader)
    } else {
        DecryptorBuilder::from_file(path)
    };
    run(builder, layout, &progress, my_key, sender, buffer_size, output)
}

fn run(
    builder: PgpResult<DecryptorBuilder<'_>>,
    layout: Layout,
    progress: &Progress,
    my_key: &PersonalKey,
    sender: Option<&ContactPublicKey>,
    buffer_size: usize,
    output: &mut dyn Write,
) -> Result<Decrypted, DecryptFailure> {
    let helper = Helper {
        my_key,
        sender,
        progress,
    };
    let policy = keys::policy();

    let result = builder
        .and_then(|builder| {
            builder
                .buffer_size(buffer_size)
                .with_policy(&policy, None, helper)
        })
        .and_then(|mut decryptor| {
            io::copy(&mut decryptor, output)?;
            Ok(decryptor.message_processed())
        });

    match result {
        Ok(true) if progress.encrypted.get() => Ok(Decrypted {
            signature: progress.signature.get().unwrap_or(SignatureOutcome::Unsigned),
            integrity_protected: !layout.has_sed,
        }),
        Ok(_) => Err(DecryptFailure::InvalidData),
        Err(e) => {
            let failure = layout.classify(progress.session_key_recovered.get());
            tracing::warn!(error = %e, ?failure, "Decryption failed");
            Err(failure)
        }
    }
}

/// Unwrap the session key of a legacy SED message and return a reader
/// over its decrypted body.
///
/// The body starts with a block of random bytes whose last two are
/// repeated; after that prefix the cipher is resynchronized.
fn legacy_plaintext<'a>(
    ppr: PgpResult<PacketParserResult<'a>>,
    my_key: &PersonalKey,
    progress: &Progress,
) -> PgpResult<symmetric::Decryptor<'a>> {
    let mut keypair = my_key.decryptor()?;
    let mut session_key = None;
    let mut ppr = ppr?;
    let mut pp = loop {
        let PacketParserResult::Some(pp) = ppr else {
            return Err(openpgp::Error::MalformedMessage("no encrypted data".into()).into());
        };
        if pp.packet.tag() == Tag::SED {
            break pp;
        }
        if session_key.is_none()
            && let Packet::PKESK(pkesk) = &pp.packet
        {
            session_key = pkesk.decrypt(&mut keypair, None);
        }
        ppr = pp.next()?.1;
    };

    let Some((Some(algo), key)) = session_key else {
        return Err(openpgp::Error::MissingSessionKey("no session key for our key".into()).into());
    };
    progress.session_key_recovered.set(true);

    let block = algo.block_size()?;
    let head = pp.data_consume_hard(block + 2)?[..block + 2].to_vec();
    let mut prefix = Vec::with_capacity(block + 2);
    symmetric::Decryptor::new(
        algo,
        BlockCipherMode::CFB,
        UnpaddingMode::None,
        &key,
        None,
        buffered_reader::Memory::with_cookie(&head, Cookie::default()),
    )?
    .read_to_end(&mut prefix)?;
    if prefix.len() != block + 2 || prefix[block - 2..block] != prefix[block..] {
        return Err(openpgp::Error::ManipulatedMessage.into());
    }

    tracing::debug!(?algo, "Legacy message without integrity protection");
    progress.encrypted.set(true);
    Ok(symmetric::Decryptor::new(
        algo,
        BlockCipherMode::CFB,
        UnpaddingMode::None,
        &key,
        Some(&head[2..]),
        pp,
    )?)
}

/// Whether `path` starts with an OpenPGP encrypted message.
pub fn is_encrypted_file(path: &Path) -> bool {
    let Ok(PacketParserResult::Some(pp)) = PacketParser::from_file(path) else {
        return false;
    };
    matches!(
        pp.packet,
        Packet::PKESK(_) | Packet::SKESK(_) | Packet::SEIP(_)
    ) || pp.packet.tag() == Tag::SED
}
