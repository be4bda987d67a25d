//! Encryption/decryption pipeline for messages, stanzas and attachments.
//!
//! The [`Coder`] never fails with `Err`: every per-message outcome is
//! recorded in the item's [`CoderStatus`] and the call returns `None` or
//! `false`. It holds no per-call state and can be shared across threads.

mod decryptor;
mod encryptor;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sealpost_core::CoderConfig;

use crate::contact_cache::ContactKeyCache;
use crate::envelope::{self, Envelope};
use crate::keys::{self, ContactPublicKey};
use crate::message::{
    Contact, DecryptedContent, EncryptedAttachment, IncomingMessage, OutgoingMessage,
};
use crate::personal::PersonalKey;
use crate::status::{CoderError, CoderStatus, Encryption, Signing};

use decryptor::{Decrypted, SignatureOutcome};

/// Prefix of encrypted attachment files.
pub const ENCRYPTED_PREFIX: &str = "encrypted_";
/// Prefix of decrypted attachment files whose source name lacks [`ENCRYPTED_PREFIX`].
pub const DECRYPTED_PREFIX: &str = "decrypted_";

pub use decryptor::is_encrypted_file;

#[derive(Debug, Clone)]
pub struct Coder {
    cache: Arc<ContactKeyCache>,
    config: CoderConfig,
}

impl Coder {
    pub const fn new(cache: Arc<ContactKeyCache>, config: CoderConfig) -> Self {
        Self { cache, config }
    }

    pub const fn cache(&self) -> &Arc<ContactKeyCache> {
        &self.cache
    }

    pub const fn config(&self) -> &CoderConfig {
        &self.config
    }

    /// Sign and encrypt the message text for all its recipients.
    ///
    /// On failure the error is added to the message status and `None` is
    /// returned; message content is never altered.
    pub fn encrypt_message(
        &self,
        my_key: Option<&PersonalKey>,
        message: &mut dyn OutgoingMessage,
    ) -> Option<Vec<u8>> {
        let (resolved, addresses) = {
            let recipients = message.recipients();
            let addresses: Vec<String> = recipients
                .iter()
                .map(|c| c.address().to_string())
                .collect();
            (self.resolve_recipients(my_key, &recipients), addresses)
        };
        let (my_key, keys) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                message.coder_status_mut().add_error(err);
                return None;
            }
        };

        let payload = Envelope::new(
            my_key.address(),
            addresses,
            envelope::TEXT_PLAIN,
            message.text(),
        )
        .to_bytes();
        match self.encrypt_payload(my_key, &keys, &payload) {
            Ok(ciphertext) => Some(ciphertext),
            Err(()) => {
                message.coder_status_mut().add_error(CoderError::UnknownError);
                None
            }
        }
    }

    /// Sign and encrypt an XMPP stanza. There is no status to update;
    /// failures are logged.
    pub fn encrypt_stanza(
        &self,
        my_key: Option<&PersonalKey>,
        recipients: &[&dyn Contact],
        stanza: &str,
    ) -> Option<Vec<u8>> {
        let (my_key, keys) = self.resolve_recipients(my_key, recipients).ok()?;
        let addresses = recipients.iter().map(|c| c.address().to_string()).collect();
        let payload =
            Envelope::new(my_key.address(), addresses, envelope::XMPP_STANZA, stanza).to_bytes();
        self.encrypt_payload(my_key, &keys, &payload).ok()
    }

    /// Sign and encrypt a file for the message's recipients into a new
    /// `encrypted_*` file in the attachment directory.
    pub fn encrypt_attachment(
        &self,
        my_key: Option<&PersonalKey>,
        message: &mut dyn OutgoingMessage,
        file: &Path,
    ) -> Option<PathBuf> {
        let resolved = self.resolve_recipients(my_key, &message.recipients());
        let (my_key, keys) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                message.coder_status_mut().add_error(err);
                return None;
            }
        };

        match self.encrypt_file(my_key, &keys, file) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, file = %file.display(), "Attachment encryption failed");
                message.coder_status_mut().add_error(CoderError::UnknownError);
                None
            }
        }
    }

    /// Decrypt and verify a received message, recording the outcome in its
    /// status. Returns whether decryption succeeded.
    ///
    /// Errors from earlier attempts are cleared first. An already decrypted
    /// message is processed again only while its signer is unknown.
    pub fn decrypt_message(
        &self,
        my_key: Option<&PersonalKey>,
        message: &mut dyn IncomingMessage,
    ) -> bool {
        let initial = *message.coder_status();
        if let Some(done) = settled(&initial) {
            return done;
        }
        let reverify = initial.encryption() == Encryption::Decrypted;

        message.coder_status_mut().clear_errors();
        let Some(my_key) = my_key else {
            message
                .coder_status_mut()
                .add_error(CoderError::MyKeyUnavailable);
            return false;
        };

        let sender_key = self.cache.resolve_contact(message.sender());
        let sender_address = message.sender().address().to_string();
        let mut plaintext = Vec::new();
        let result = message.encrypted_content().map_or(
            Err(decryptor::DecryptFailure::InvalidData),
            |data| {
                decryptor::decrypt_bytes(
                    my_key,
                    sender_key.as_deref(),
                    data,
                    self.config.decrypt_buffer_bytes,
                    &mut plaintext,
                )
            },
        );

        let decrypted = match result {
            Ok(decrypted) => decrypted,
            Err(failure) => {
                message.coder_status_mut().add_error(failure.error());
                return false;
            }
        };
        let payload = match Envelope::parse(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Decrypted payload rejected");
                message.coder_status_mut().add_error(CoderError::InvalidData);
                return false;
            }
        };

        let status = message.coder_status_mut();
        if !reverify {
            status.mark_decrypted();
        }
        apply_outcome(status, decrypted);
        check_envelope(
            status,
            &payload,
            my_key,
            sender_key.as_deref(),
            &sender_address,
        );
        tracing::debug!(%status, "Message decrypted");

        if !reverify {
            message.set_decrypted_content(DecryptedContent {
                body: payload.body,
                content_type: payload.content_type,
                from: payload.from,
                to: payload.to,
            });
        }
        true
    }

    /// Decrypt and verify a downloaded attachment.
    ///
    /// Plaintext goes to a temporary file next to the encrypted one and is
    /// moved into place only on success, so failures leave no partial
    /// output behind.
    pub fn decrypt_attachment(
        &self,
        my_key: Option<&PersonalKey>,
        attachment: &mut dyn EncryptedAttachment,
        sender: &dyn Contact,
    ) -> bool {
        let initial = *attachment.coder_status();
        if let Some(done) = settled(&initial) {
            return done;
        }
        let reverify = initial.encryption() == Encryption::Decrypted;

        attachment.coder_status_mut().clear_errors();
        let Some(my_key) = my_key else {
            attachment
                .coder_status_mut()
                .add_error(CoderError::MyKeyUnavailable);
            return false;
        };

        let sender_key = self.cache.resolve_contact(sender);
        let input = attachment.encrypted_file().to_path_buf();
        let buffer = self.config.decrypt_buffer_bytes;

        if reverify {
            return match decryptor::decrypt_file(
                my_key,
                sender_key.as_deref(),
                &input,
                buffer,
                &mut io::sink(),
            ) {
                Ok(decrypted) => {
                    apply_outcome(attachment.coder_status_mut(), decrypted);
                    true
                }
                Err(failure) => {
                    attachment.coder_status_mut().add_error(failure.error());
                    false
                }
            };
        }

        let dir = input
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = match tempfile::NamedTempFile::new_in(dir) {
            Ok(tmp) => tmp,
            Err(e) => {
                tracing::warn!(error = %e, dir = %dir.display(), "Cannot create decryption output");
                attachment.coder_status_mut().add_error(CoderError::UnknownError);
                return false;
            }
        };

        let result =
            decryptor::decrypt_file(my_key, sender_key.as_deref(), &input, buffer, &mut tmp)
                .map_err(|failure| Some(failure.error()))
                .and_then(|decrypted| {
                    tmp.flush().map_err(|_| None)?;
                    let target = dir.join(decrypted_file_name(&input));
                    tmp.persist(&target).map_err(|e| {
                        tracing::warn!(
                            error = %e.error,
                            target = %target.display(),
                            "Cannot store decrypted attachment"
                        );
                        None
                    })?;
                    Ok((decrypted, target))
                });

        match result {
            Ok((decrypted, target)) => {
                let status = attachment.coder_status_mut();
                status.mark_decrypted();
                apply_outcome(status, decrypted);
                tracing::debug!(%status, file = %target.display(), "Attachment decrypted");
                attachment.set_decrypted_file(target);
                true
            }
            Err(err) => {
                attachment
                    .coder_status_mut()
                    .add_error(err.unwrap_or(CoderError::UnknownError));
                false
            }
        }
    }

    fn resolve_recipients<'k>(
        &self,
        my_key: Option<&'k PersonalKey>,
        recipients: &[&dyn Contact],
    ) -> Result<(&'k PersonalKey, Vec<Arc<ContactPublicKey>>), CoderError> {
        let Some(my_key) = my_key else {
            tracing::warn!("Personal key not loaded, cannot encrypt");
            return Err(CoderError::MyKeyUnavailable);
        };
        let mut keys = Vec::with_capacity(recipients.len());
        for contact in recipients {
            let Some(key) = self.cache.resolve_contact(*contact) else {
                tracing::warn!(recipient = %contact.address(), "Recipient key unavailable");
                return Err(CoderError::KeyUnavailable);
            };
            keys.push(key);
        }
        Ok((my_key, keys))
    }

    fn encrypt_payload(
        &self,
        my_key: &PersonalKey,
        keys: &[Arc<ContactPublicKey>],
        payload: &[u8],
    ) -> Result<Vec<u8>, ()> {
        let mut out = Vec::new();
        encryptor::sign_and_encrypt(
            my_key,
            keys,
            self.config.encrypt_to_self,
            &mut &payload[..],
            &mut out,
        )
        .map_err(|e| tracing::warn!(error = %e, "Encryption failed"))?;
        Ok(out)
    }

    fn encrypt_file(
        &self,
        my_key: &PersonalKey,
        keys: &[Arc<ContactPublicKey>],
        file: &Path,
    ) -> anyhow::Result<PathBuf> {
        let dir = self
            .config
            .attachment_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&dir)?;
        let mut input = File::open(file)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(ENCRYPTED_PREFIX)
            .tempfile_in(&dir)?;
        let written = encryptor::sign_and_encrypt(
            my_key,
            keys,
            self.config.encrypt_to_self,
            &mut input,
            &mut tmp,
        )?;
        tmp.flush()?;
        let (_, path) = tmp.keep()?;
        tracing::debug!(bytes = written, path = %path.display(), "Attachment encrypted");
        Ok(path)
    }
}

/// Short-circuit for items that need no (further) processing.
fn settled(status: &CoderStatus) -> Option<bool> {
    match (status.encryption(), status.signing()) {
        (Encryption::Not, _) => Some(true),
        (Encryption::Decrypted, Signing::Unknown) | (Encryption::Encrypted, _) => None,
        (Encryption::Decrypted, _) => Some(true),
    }
}

fn apply_outcome(status: &mut CoderStatus, decrypted: Decrypted) {
    if !decrypted.integrity_protected {
        status.add_error(CoderError::NoIntegrity);
    }
    apply_signature(status, decrypted.signature);
}

fn apply_signature(status: &mut CoderStatus, outcome: SignatureOutcome) {
    match outcome {
        SignatureOutcome::Unsigned => {
            status.mark_unsigned();
        }
        SignatureOutcome::SignerUnknown => {
            status.mark_signer_unknown();
        }
        SignatureOutcome::Verified => {
            status.mark_signed();
            status.mark_verified();
        }
        SignatureOutcome::Malformed => {
            status.mark_signed();
            status.add_error(CoderError::InvalidSignatureData);
        }
        SignatureOutcome::Invalid => {
            status.mark_signed();
            status.add_error(CoderError::InvalidSignature);
        }
    }
}

/// Envelope identities must name us as recipient and the key owner as sender.
fn check_envelope(
    status: &mut CoderStatus,
    payload: &Envelope,
    my_key: &PersonalKey,
    sender_key: Option<&ContactPublicKey>,
    sender_address: &str,
) {
    if !payload.to.is_empty()
        && !payload
            .to
            .iter()
            .any(|to| keys::addresses_match(to, my_key.address()))
    {
        tracing::warn!(to = ?payload.to, "Message not addressed to us");
        status.add_error(CoderError::InvalidRecipient);
    }

    if let Some(from) = &payload.from {
        let expected = sender_key
            .and_then(ContactPublicKey::address)
            .unwrap_or(sender_address);
        if !keys::addresses_match(from, expected) {
            tracing::warn!(%from, %expected, "Envelope sender mismatch");
            status.add_error(CoderError::InvalidSender);
        }
    }
}

/// `encrypted_photo.jpg` → `photo.jpg`; anything else gets `decrypted_`.
fn decrypted_file_name(encrypted: &Path) -> String {
    let name = encrypted
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_prefix(ENCRYPTED_PREFIX) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => format!("{DECRYPTED_PREFIX}{name}"),
    }
}
