//! The user's own key material.
//!
//! One secret keyring yields three logical keys: the primary key
//! authenticates (and backs the X.509 bridge certificate), a signing subkey
//! signs, an encryption subkey decrypts. Legacy keyrings without a signing
//! subkey sign with the primary key.

use openpgp::armor::{Kind as ArmorKind, Writer as ArmorWriter};
use openpgp::cert::prelude::*;
use openpgp::crypto::{KeyPair, Password};
use openpgp::packet::Key;
use openpgp::packet::key::{SecretParts, UnspecifiedRole};
use openpgp::parse::Parse;
use openpgp::serialize::{Serialize, SerializeInto};
use openpgp::{Fingerprint, Packet};
use sequoia_openpgp as openpgp;
use zeroize::Zeroizing;

use crate::bridge;
use crate::error::AccountError;
use crate::keys::{self, ContactPublicKey, UserId};

type SecretKey = Key<SecretParts, UnspecifiedRole>;

/// The logged-in user's keys, fully unlocked.
///
/// Immutable once built; a new keyring produces a new `PersonalKey`.
pub struct PersonalKey {
    cert: Cert,
    public_keyring: Vec<u8>,
    auth_public: [u8; 32],
    login_key: Zeroizing<Vec<u8>>,
    signing_key: SecretKey,
    encryption_key: SecretKey,
    bridge_cert: Vec<u8>,
    user_id: String,
    parsed_user_id: UserId,
    fingerprint: String,
}

impl std::fmt::Debug for PersonalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersonalKey")
            .field("fingerprint", &self.fingerprint)
            .field("user_id", &self.user_id)
            .field("signing_key", &self.signing_key.fingerprint().to_hex())
            .field("encryption_key", &self.encryption_key.fingerprint().to_hex())
            .field("login_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl PersonalKey {
    /// Load a secret keyring (binary or armored).
    ///
    /// Keys without secret protection are accepted as-is; protected keys are
    /// unlocked with `passphrase`. A bridge certificate (DER or PEM) is
    /// verified against the authentication key, or derived when absent.
    pub fn load(
        keyring: &[u8],
        passphrase: Option<&str>,
        bridge_cert: Option<&[u8]>,
    ) -> Result<Self, AccountError> {
        let cert = Cert::from_bytes(keyring).map_err(AccountError::load)?;
        if !cert.is_tsk() {
            return Err(AccountError::LoadKey("keyring has no secret keys".into()));
        }
        let user_id = keys::primary_user_id(&cert)
            .ok_or_else(|| AccountError::LoadKey("keyring has no user id".into()))?;
        let password = passphrase.map(Password::from);

        let p = keys::policy();
        let vc = cert.with_policy(&p, None).map_err(AccountError::load)?;

        let auth_key = vc
            .primary_key()
            .key()
            .clone()
            .parts_into_secret()
            .map_err(AccountError::load)?
            .role_into_unspecified();

        let signing_subkey = vc
            .keys()
            .subkeys()
            .secret()
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .map(|ka| ka.key().clone().role_into_unspecified());

        let encryption_key = vc
            .keys()
            .secret()
            .supported()
            .alive()
            .revoked(false)
            .key_flags(keys::encryption_flags())
            .next()
            .map(|ka| ka.key().clone())
            .ok_or_else(|| AccountError::LoadKey("no encryption key".into()))?;

        let primary_signs = vc.primary_key().for_signing();
        let auth_key = unlock(auth_key, password.as_ref())?;
        let signing_key = match signing_subkey {
            Some(key) => unlock(key, password.as_ref())?,
            None if primary_signs => {
                tracing::info!(
                    fingerprint = %cert.fingerprint(),
                    "Legacy keyring: signing with the primary key"
                );
                auth_key.clone()
            }
            None => return Err(AccountError::LoadKey("no signing key".into())),
        };
        let encryption_key = unlock(encryption_key, password.as_ref())?;

        let auth_public = bridge::ed25519_public(&auth_key).map_err(AccountError::load)?;
        let login_key = bridge::login_key_pkcs8(&auth_key).map_err(AccountError::load)?;
        drop(auth_key);

        let cert = cert.strip_secret_key_material();
        let public_keyring = cert.to_vec().map_err(AccountError::load)?;
        let parsed_user_id = UserId::parse(&user_id);

        let bridge_cert = match bridge_cert {
            Some(bytes) => bridge::load_certificate(bytes, &auth_public),
            None => bridge::derive_certificate(
                &login_key,
                &public_keyring,
                &parsed_user_id,
                cert.fingerprint().as_bytes(),
            ),
        }
        .map_err(AccountError::load)?;

        let fingerprint = keys::fingerprint_hex(&cert.fingerprint());
        tracing::debug!(%fingerprint, "Personal key loaded");

        Ok(Self {
            cert,
            public_keyring,
            auth_public,
            login_key,
            signing_key,
            encryption_key,
            bridge_cert,
            user_id,
            parsed_user_id,
            fingerprint,
        })
    }

    /// Lowercase hex fingerprint of the primary (authentication) key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Address part of the primary user id.
    pub fn address(&self) -> &str {
        self.parsed_user_id.address()
    }

    /// Serialized public keyring, suitable for upload.
    pub fn public_keyring(&self) -> &[u8] {
        &self.public_keyring
    }

    /// Bridge certificate, DER.
    pub fn bridge_certificate(&self) -> &[u8] {
        &self.bridge_cert
    }

    /// Authentication private key as PKCS#8 DER, for TLS client auth.
    pub fn login_key(&self) -> &[u8] {
        &self.login_key
    }

    /// Raw Ed25519 public authentication key.
    pub const fn authentication_key(&self) -> &[u8; 32] {
        &self.auth_public
    }

    pub fn signing_key_fingerprint(&self) -> Fingerprint {
        self.signing_key.fingerprint()
    }

    pub fn encryption_key_fingerprint(&self) -> Fingerprint {
        self.encryption_key.fingerprint()
    }

    /// Our own public key in contact form, for verifying our own messages.
    pub fn to_contact_key(&self) -> anyhow::Result<ContactPublicKey> {
        ContactPublicKey::from_cert(self.cert.clone())
    }

    pub(crate) const fn cert(&self) -> &Cert {
        &self.cert
    }

    pub(crate) fn signer(&self) -> openpgp::Result<KeyPair> {
        self.signing_key.clone().into_keypair()
    }

    pub(crate) fn decryptor(&self) -> openpgp::Result<KeyPair> {
        self.encryption_key.clone().into_keypair()
    }
}

fn unlock(key: SecretKey, password: Option<&Password>) -> Result<SecretKey, AccountError> {
    if !key.secret().is_encrypted() {
        return Ok(key);
    }
    let password = password.ok_or_else(|| {
        AccountError::LoadKey(format!("passphrase required for key {}", key.fingerprint()))
    })?;
    key.decrypt_secret(password).map_err(|e| {
        tracing::warn!(error = %e, "Failed to unlock key");
        AccountError::LoadKey("wrong passphrase".into())
    })
}

/// Re-protect every secret key of `keyring` with `new`, returning the
/// armored result. Unprotected keys need no `old` passphrase.
pub(crate) fn reencrypt_keyring(
    keyring: &[u8],
    old: Option<&str>,
    new: &str,
) -> anyhow::Result<Vec<u8>> {
    let cert = Cert::from_bytes(keyring)?;
    let old = old.map(Password::from);
    let new = Password::from(new);

    let mut packets: Vec<Packet> = Vec::new();
    for ka in cert.keys().secret() {
        let mut key = ka.key().clone();
        if key.secret().is_encrypted() {
            let old = old
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("passphrase required"))?;
            key = key.decrypt_secret(old)?;
        }
        let key = key.encrypt_secret(&new)?;
        if ka.primary() {
            packets.push(key.role_into_primary().into());
        } else {
            packets.push(key.role_into_subordinate().into());
        }
    }
    anyhow::ensure!(!packets.is_empty(), "keyring has no secret keys");

    let (cert, _) = cert.strip_secret_key_material().insert_packets(packets)?;
    armor_secret(&cert)
}

/// ASCII-armored secret keyring.
pub(crate) fn armor_secret(cert: &Cert) -> anyhow::Result<Vec<u8>> {
    let mut writer = ArmorWriter::new(Vec::new(), ArmorKind::SecretKey)?;
    cert.as_tsk().serialize(&mut writer)?;
    Ok(writer.finalize()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::AccountErrorKind;
    use crate::testing;

    #[test]
    fn load_exposes_three_keys() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", Some("pw"));
        let key = PersonalKey::load(&testing::secret_armored(&cert), Some("pw"), None).unwrap();

        assert_eq!(key.fingerprint(), keys::fingerprint_hex(&cert.fingerprint()));
        assert_eq!(key.user_id(), "Alice <alice@example.com>");
        assert_eq!(key.address(), "alice@example.com");
        assert_ne!(key.signing_key_fingerprint(), cert.fingerprint());
        assert_ne!(key.signing_key_fingerprint(), key.encryption_key_fingerprint());
        assert!(!key.bridge_certificate().is_empty());
        assert_eq!(key.login_key().len(), 48);
    }

    #[test]
    fn public_keyring_carries_no_secrets() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let key = PersonalKey::load(&testing::secret_bytes(&cert), None, None).unwrap();
        let exported = Cert::from_bytes(key.public_keyring()).unwrap();
        assert!(!exported.is_tsk());
        assert_eq!(exported.fingerprint(), cert.fingerprint());
    }

    #[test]
    fn wrong_passphrase_fails_load_key() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", Some("pw"));
        let err = PersonalKey::load(&testing::secret_bytes(&cert), Some("nope"), None).unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::LoadKey);

        let err = PersonalKey::load(&testing::secret_bytes(&cert), None, None).unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::LoadKey);
    }

    #[test]
    fn public_only_keyring_fails() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let err = PersonalKey::load(&testing::public_bytes(&cert), None, None).unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::LoadKey);
    }

    #[test]
    fn missing_encryption_key_fails() {
        let cert = testing::generate_signing_only_keyring("Alice <alice@example.com>");
        let err = PersonalKey::load(&testing::secret_bytes(&cert), None, None).unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::LoadKey);
    }

    #[test]
    fn legacy_keyring_signs_with_primary() {
        let cert = testing::generate_legacy_keyring("Bob <bob@example.com>", Some("pw"));
        let key = PersonalKey::load(&testing::secret_armored(&cert), Some("pw"), None).unwrap();
        assert_eq!(key.signing_key_fingerprint(), cert.fingerprint());
    }

    #[test]
    fn supplied_bridge_certificate_is_kept() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let bytes = testing::secret_bytes(&cert);
        let first = PersonalKey::load(&bytes, None, None).unwrap();
        let second = PersonalKey::load(&bytes, None, Some(first.bridge_certificate())).unwrap();
        assert_eq!(first.bridge_certificate(), second.bridge_certificate());

        let other = testing::generate_keyring("Eve <eve@example.com>", None);
        let other = PersonalKey::load(&testing::secret_bytes(&other), None, None).unwrap();
        let err = PersonalKey::load(&bytes, None, Some(other.bridge_certificate())).unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::LoadKey);
    }

    #[test]
    fn debug_redacts_login_key() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let key = PersonalKey::load(&testing::secret_bytes(&cert), None, None).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains(key.fingerprint()));
    }

    #[test]
    fn reencrypt_switches_passphrase() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", Some("old"));
        let rekeyed =
            reencrypt_keyring(&testing::secret_bytes(&cert), Some("old"), "new").unwrap();

        assert!(PersonalKey::load(&rekeyed, Some("new"), None).is_ok());
        assert!(PersonalKey::load(&rekeyed, Some("old"), None).is_err());
    }

    #[test]
    fn reencrypt_with_wrong_old_passphrase_fails() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", Some("old"));
        assert!(reencrypt_keyring(&testing::secret_bytes(&cert), Some("bad"), "new").is_err());
        assert!(reencrypt_keyring(&testing::secret_bytes(&cert), None, "new").is_err());
    }

    #[test]
    fn reencrypt_protects_unprotected_keyring() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let rekeyed = reencrypt_keyring(&testing::secret_bytes(&cert), None, "fresh").unwrap();
        assert!(PersonalKey::load(&rekeyed, None, None).is_err());
        assert!(PersonalKey::load(&rekeyed, Some("fresh"), None).is_ok());
    }
}
