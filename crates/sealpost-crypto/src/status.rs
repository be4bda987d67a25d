//! Per-message encryption/signing state and failure taxonomy.
//!
//! A [`CoderStatus`] is attached to every message and, independently, to
//! every attachment. It is the only place per-message failures surface: the
//! codec never returns them as `Err`. The integer encodings are persisted by
//! the storage layer and are written out per variant so that reordering the
//! enums can never change what is on disk.

use std::fmt;

/// Encryption state of a message body or attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encryption {
    /// Never encrypted.
    Not,
    /// Ciphertext held, not (yet) decrypted.
    Encrypted,
    /// Successfully decrypted with integrity verified.
    Decrypted,
}

impl Encryption {
    pub const fn to_stored(self) -> i32 {
        match self {
            Self::Not => 0,
            Self::Encrypted => 1,
            Self::Decrypted => 2,
        }
    }

    pub const fn from_stored(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Not),
            1 => Some(Self::Encrypted),
            2 => Some(Self::Decrypted),
            _ => None,
        }
    }
}

/// Signature state of a message body or attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signing {
    /// No signature present.
    Not,
    /// Signature present but not verified.
    Signed,
    /// Signature verified against the sender's key.
    Verified,
    /// Signature state cannot be determined yet (sender key unavailable, or
    /// content still encrypted).
    Unknown,
}

impl Signing {
    pub const fn to_stored(self) -> i32 {
        match self {
            Self::Not => 0,
            Self::Signed => 1,
            Self::Verified => 2,
            Self::Unknown => 3,
        }
    }

    pub const fn from_stored(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Not),
            1 => Some(Self::Signed),
            2 => Some(Self::Verified),
            3 => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Per-message failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoderError {
    UnknownError,
    /// Our own personal key is not loaded.
    MyKeyUnavailable,
    /// A correspondent's public key is missing or unparseable.
    KeyUnavailable,
    /// No session key could be decrypted with our key.
    InvalidPrivateKey,
    /// Payload is not a parseable encrypted message.
    InvalidData,
    /// Legacy encrypted data without integrity protection.
    NoIntegrity,
    /// Integrity check failed after the session key was recovered.
    InvalidIntegrity,
    /// The signature packet itself is malformed.
    InvalidSignatureData,
    /// The signature does not verify.
    InvalidSignature,
    /// Envelope recipient is not us.
    InvalidRecipient,
    /// Envelope sender does not match the signing key's owner.
    InvalidSender,
}

impl CoderError {
    pub const ALL: [Self; 11] = [
        Self::UnknownError,
        Self::MyKeyUnavailable,
        Self::KeyUnavailable,
        Self::InvalidPrivateKey,
        Self::InvalidData,
        Self::NoIntegrity,
        Self::InvalidIntegrity,
        Self::InvalidSignatureData,
        Self::InvalidSignature,
        Self::InvalidRecipient,
        Self::InvalidSender,
    ];

    /// Fixed bit position in the persisted mask. Append-only.
    pub const fn bit(self) -> u32 {
        match self {
            Self::UnknownError => 0,
            Self::MyKeyUnavailable => 1,
            Self::KeyUnavailable => 2,
            Self::InvalidPrivateKey => 3,
            Self::InvalidData => 4,
            Self::NoIntegrity => 5,
            Self::InvalidIntegrity => 6,
            Self::InvalidSignatureData => 7,
            Self::InvalidSignature => 8,
            Self::InvalidRecipient => 9,
            Self::InvalidSender => 10,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::MyKeyUnavailable => "MY_KEY_UNAVAILABLE",
            Self::KeyUnavailable => "KEY_UNAVAILABLE",
            Self::InvalidPrivateKey => "INVALID_PRIVATE_KEY",
            Self::InvalidData => "INVALID_DATA",
            Self::NoIntegrity => "NO_INTEGRITY",
            Self::InvalidIntegrity => "INVALID_INTEGRITY",
            Self::InvalidSignatureData => "INVALID_SIGNATURE_DATA",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::InvalidRecipient => "INVALID_RECIPIENT",
            Self::InvalidSender => "INVALID_SENDER",
        }
    }

    /// Errors that can never coexist with `Encryption::Decrypted`.
    const fn contradicts_decrypted(self) -> bool {
        matches!(
            self,
            Self::MyKeyUnavailable
                | Self::InvalidPrivateKey
                | Self::InvalidData
                | Self::InvalidIntegrity
        )
    }

    /// Errors that can never coexist with `Signing::Verified`.
    const fn contradicts_verified(self) -> bool {
        matches!(self, Self::InvalidSignature | Self::InvalidSignatureData)
    }
}

impl fmt::Display for CoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of [`CoderError`]s, persisted as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorSet(u32);

impl ErrorSet {
    const KNOWN_MASK: u32 = (1 << 11) - 1;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Decode a persisted mask. Unknown bits are dropped.
    pub fn from_mask(mask: u32) -> Self {
        let unknown = mask & !Self::KNOWN_MASK;
        if unknown != 0 {
            tracing::warn!(mask, unknown, "Dropping unknown coder error bits");
        }
        Self(mask & Self::KNOWN_MASK)
    }

    pub const fn mask(self) -> u32 {
        self.0
    }

    pub const fn contains(self, err: CoderError) -> bool {
        self.0 & (1 << err.bit()) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    fn insert(&mut self, err: CoderError) {
        self.0 |= 1 << err.bit();
    }

    fn retain(&mut self, keep: impl Fn(CoderError) -> bool) {
        for err in self.iter() {
            if !keep(err) {
                self.0 &= !(1 << err.bit());
            }
        }
    }

    pub fn iter(self) -> impl Iterator<Item = CoderError> {
        CoderError::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(err.as_str())?;
            first = false;
        }
        Ok(())
    }
}

/// Encryption state, signing state and accumulated errors of one item.
///
/// All mutation goes through the guarded `mark_*` and `add_error` methods,
/// which refuse transitions that would misreport trust state and return
/// `false` when they do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoderStatus {
    encryption: Encryption,
    signing: Signing,
    errors: ErrorSet,
}

impl Default for CoderStatus {
    fn default() -> Self {
        Self::plain()
    }
}

impl CoderStatus {
    /// Status of plaintext content: not encrypted, not signed.
    pub const fn plain() -> Self {
        Self {
            encryption: Encryption::Not,
            signing: Signing::Not,
            errors: ErrorSet::empty(),
        }
    }

    /// Initial status of received content.
    ///
    /// Ciphertext starts as (ENCRYPTED, UNKNOWN) because whether it is
    /// signed is only known after decryption.
    pub const fn received(encrypted: bool) -> Self {
        if encrypted {
            Self {
                encryption: Encryption::Encrypted,
                signing: Signing::Unknown,
                errors: ErrorSet::empty(),
            }
        } else {
            Self::plain()
        }
    }

    /// Status of content we just encrypted and signed ourselves.
    pub const fn sent_secure() -> Self {
        Self {
            encryption: Encryption::Encrypted,
            signing: Signing::Signed,
            errors: ErrorSet::empty(),
        }
    }

    /// Restore a persisted triple. `None` if either enum value is unknown.
    pub fn from_stored(encryption: i32, signing: i32, error_mask: u32) -> Option<Self> {
        let encryption = Encryption::from_stored(encryption)?;
        let signing = Signing::from_stored(signing)?;
        let mut errors = ErrorSet::from_mask(error_mask);
        // A stored claim of success wins over contradicting error bits.
        if encryption == Encryption::Decrypted {
            errors.retain(|e| !e.contradicts_decrypted());
        }
        if signing == Signing::Verified {
            errors.retain(|e| !e.contradicts_verified());
        }
        Some(Self {
            encryption,
            signing,
            errors,
        })
    }

    /// `(encryption, signing, error_mask)` as persisted.
    pub const fn to_stored(&self) -> (i32, i32, u32) {
        (
            self.encryption.to_stored(),
            self.signing.to_stored(),
            self.errors.mask(),
        )
    }

    pub const fn encryption(&self) -> Encryption {
        self.encryption
    }

    pub const fn signing(&self) -> Signing {
        self.signing
    }

    pub const fn errors(&self) -> ErrorSet {
        self.errors
    }

    pub const fn has_error(&self, err: CoderError) -> bool {
        self.errors.contains(err)
    }

    /// Whether the item is (still) encrypted.
    pub const fn is_encrypted(&self) -> bool {
        matches!(self.encryption, Encryption::Encrypted)
    }

    /// Whether the item was ever encrypted.
    pub const fn is_secure(&self) -> bool {
        !matches!(self.encryption, Encryption::Not)
    }

    /// NOT → ENCRYPTED.
    pub fn mark_encrypted(&mut self) -> bool {
        self.transition_encryption(Encryption::Not, Encryption::Encrypted)
    }

    /// ENCRYPTED → DECRYPTED. Refused while a decrypt-contradicting error is set.
    pub fn mark_decrypted(&mut self) -> bool {
        if let Some(err) = self.errors.iter().find(|e| e.contradicts_decrypted()) {
            tracing::debug!(%err, "Refusing DECRYPTED with contradicting error");
            return false;
        }
        self.transition_encryption(Encryption::Encrypted, Encryption::Decrypted)
    }

    /// NOT/UNKNOWN → SIGNED. Staying SIGNED is allowed.
    pub fn mark_signed(&mut self) -> bool {
        self.transition_signing(
            &[Signing::Not, Signing::Unknown, Signing::Signed],
            Signing::Signed,
        )
    }

    /// SIGNED → VERIFIED. Refused while a signature error is set.
    pub fn mark_verified(&mut self) -> bool {
        if let Some(err) = self.errors.iter().find(|e| e.contradicts_verified()) {
            tracing::debug!(%err, "Refusing VERIFIED with contradicting error");
            return false;
        }
        self.transition_signing(&[Signing::Signed], Signing::Verified)
    }

    /// SIGNED/UNKNOWN → UNKNOWN: a signature exists but the signer's key is
    /// not available.
    pub fn mark_signer_unknown(&mut self) -> bool {
        self.transition_signing(&[Signing::Signed, Signing::Unknown], Signing::Unknown)
    }

    /// UNKNOWN/NOT → NOT: decryption revealed no signature.
    pub fn mark_unsigned(&mut self) -> bool {
        self.transition_signing(&[Signing::Unknown, Signing::Not], Signing::Not)
    }

    /// Record an error. Refused if it contradicts an already claimed success.
    pub fn add_error(&mut self, err: CoderError) -> bool {
        if (self.encryption == Encryption::Decrypted && err.contradicts_decrypted())
            || (self.signing == Signing::Verified && err.contradicts_verified())
        {
            tracing::debug!(%err, encryption = ?self.encryption, signing = ?self.signing,
                "Refusing error that contradicts current status");
            return false;
        }
        self.errors.insert(err);
        true
    }

    pub fn clear_errors(&mut self) {
        self.errors = ErrorSet::empty();
    }

    fn transition_encryption(&mut self, from: Encryption, to: Encryption) -> bool {
        if self.encryption != from {
            tracing::debug!(
                current = ?self.encryption,
                target = ?to,
                "Illegal encryption transition"
            );
            return false;
        }
        self.encryption = to;
        true
    }

    fn transition_signing(&mut self, from: &[Signing], to: Signing) -> bool {
        if !from.contains(&self.signing) {
            tracing::debug!(current = ?self.signing, target = ?to, "Illegal signing transition");
            return false;
        }
        self.signing = to;
        true
    }
}

impl fmt::Display for CoderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encryption={:?} signing={:?}", self.encryption, self.signing)?;
        if !self.errors.is_empty() {
            write!(f, " errors=[{}]", self.errors)?;
        }
        Ok(())
    }
}
