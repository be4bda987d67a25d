//! Key material model: identities, fingerprints and correspondent keys.

use std::sync::LazyLock;

use openpgp::Fingerprint;
use openpgp::cert::prelude::*;
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::SerializeInto;
use openpgp::types::KeyFlags;
use regex::Regex;
use sequoia_openpgp as openpgp;
use subtle::ConstantTimeEq;

/// `Name (comment) <address>`; every part optional.
static USER_ID_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<name>[^<(]*?)\s*(?:\((?P<comment>[^)]*)\)\s*)?(?:<(?P<email>[^>]*)>)?\s*$")
        .ok()
});

/// A parsed OpenPGP user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId {
    pub name: String,
    pub comment: Option<String>,
    pub email: Option<String>,
}

impl UserId {
    pub fn parse(raw: &str) -> Self {
        let caps = USER_ID_RE.as_ref().and_then(|re| re.captures(raw));
        let Some(caps) = caps else {
            return Self {
                name: raw.trim().to_string(),
                comment: None,
                email: None,
            };
        };
        let non_empty = |key: &str| {
            caps.name(key)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let mut email = non_empty("email");
        let mut name = non_empty("name").unwrap_or_default();
        // A bare address with no angle brackets.
        if email.is_none() && !name.contains(' ') && name.contains('@') {
            email = Some(std::mem::take(&mut name));
        }
        Self {
            name,
            comment: non_empty("comment"),
            email,
        }
    }

    /// The address part, or the name when there is none.
    pub fn address(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.name)
    }
}

/// Primary user id of a certificate, as a string.
pub(crate) fn primary_user_id(cert: &Cert) -> Option<String> {
    cert.userids()
        .next()
        .map(|ua| String::from_utf8_lossy(ua.userid().value()).into_owned())
}

/// Lowercase hex form used everywhere a fingerprint is stored or compared.
pub fn fingerprint_hex(fpr: &Fingerprint) -> String {
    fpr.to_hex().to_ascii_lowercase()
}

/// Strip whitespace and separators, lowercase.
pub fn normalize_fingerprint(fpr: &str) -> String {
    fpr.chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Compare two fingerprints, ignoring case and whitespace, in constant time.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    let a = normalize_fingerprint(a);
    let b = normalize_fingerprint(b);
    !a.is_empty() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Bare, lowercase form of an address: `Alice@Example.com/phone` → `alice@example.com`.
pub fn bare_address(addr: &str) -> String {
    let addr = addr.trim();
    let bare = addr.split_once('/').map_or(addr, |(bare, _)| bare);
    bare.to_lowercase()
}

pub fn addresses_match(a: &str, b: &str) -> bool {
    bare_address(a) == bare_address(b)
}

pub(crate) fn policy() -> StandardPolicy<'static> {
    StandardPolicy::new()
}

/// Flags accepted for the encryption component.
pub(crate) fn encryption_flags() -> KeyFlags {
    KeyFlags::empty()
        .set_transport_encryption()
        .set_storage_encryption()
}

/// A correspondent's public key, parsed and ready for encryption and
/// signature verification.
#[derive(Debug, Clone)]
pub struct ContactPublicKey {
    cert: Cert,
    fingerprint: String,
    signing_key: Fingerprint,
    encryption_key: Fingerprint,
    user_id: Option<UserId>,
}

impl ContactPublicKey {
    /// Parse a public keyring (binary or armored). Secret material, if any,
    /// is dropped.
    pub fn from_bytes(raw: &[u8]) -> anyhow::Result<Self> {
        let cert = Cert::from_bytes(raw)?.strip_secret_key_material();
        Self::from_cert(cert)
    }

    pub(crate) fn from_cert(cert: Cert) -> anyhow::Result<Self> {
        let p = policy();
        let vc = cert.with_policy(&p, None)?;

        let signing_key = vc
            .keys()
            .subkeys()
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .map(|ka| ka.key().fingerprint())
            .or_else(|| {
                vc.primary_key()
                    .for_signing()
                    .then(|| vc.primary_key().key().fingerprint())
            })
            .ok_or_else(|| anyhow::anyhow!("no signing-capable key"))?;

        let encryption_key = vc
            .keys()
            .supported()
            .alive()
            .revoked(false)
            .key_flags(encryption_flags())
            .next()
            .map(|ka| ka.key().fingerprint())
            .ok_or_else(|| anyhow::anyhow!("no encryption-capable key"))?;

        let user_id = primary_user_id(&cert).map(|uid| UserId::parse(&uid));
        let fingerprint = fingerprint_hex(&cert.fingerprint());

        Ok(Self {
            cert,
            fingerprint,
            signing_key,
            encryption_key,
            user_id,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Address from the primary user id, used for sender checks.
    pub fn address(&self) -> Option<&str> {
        self.user_id.as_ref().map(UserId::address)
    }

    pub fn signing_key_fingerprint(&self) -> &Fingerprint {
        &self.signing_key
    }

    pub fn encryption_key_fingerprint(&self) -> &Fingerprint {
        &self.encryption_key
    }

    pub(crate) const fn cert(&self) -> &Cert {
        &self.cert
    }

    /// Serialized public keyring.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        self.cert.to_vec()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn user_id_full_form() {
        let uid = UserId::parse("Alice Liddell (phone) <alice@example.com>");
        assert_eq!(uid.name, "Alice Liddell");
        assert_eq!(uid.comment.as_deref(), Some("phone"));
        assert_eq!(uid.address(), "alice@example.com");
    }

    #[test]
    fn user_id_bare_address() {
        let uid = UserId::parse("bob@example.com");
        assert_eq!(uid.email.as_deref(), Some("bob@example.com"));
        assert!(uid.name.is_empty());
    }

    #[test]
    fn user_id_name_only() {
        let uid = UserId::parse("Carol");
        assert_eq!(uid.name, "Carol");
        assert_eq!(uid.email, None);
        assert_eq!(uid.address(), "Carol");
    }

    #[test]
    fn fingerprint_comparison_ignores_case_and_whitespace() {
        assert!(fingerprints_match("ABCD 1234", "abcd1234"));
        assert!(fingerprints_match("ab:cd", "ABCD"));
        assert!(!fingerprints_match("abcd", "abce"));
        assert!(!fingerprints_match("", ""));
    }

    #[test]
    fn bare_address_strips_resource() {
        assert_eq!(bare_address("Alice@Example.com/phone"), "alice@example.com");
        assert!(addresses_match("alice@example.com", "ALICE@example.com/x"));
        assert!(!addresses_match("alice@example.com", "bob@example.com"));
    }

    #[test]
    fn contact_key_parses_components() {
        let keyring = testing::generate_keyring("Dave <dave@example.com>", None);
        let public = testing::public_bytes(&keyring);
        let key = ContactPublicKey::from_bytes(&public).unwrap();

        assert_eq!(key.address(), Some("dave@example.com"));
        assert_eq!(key.fingerprint(), fingerprint_hex(&keyring.fingerprint()));
        assert_ne!(key.signing_key_fingerprint(), &keyring.fingerprint());
        assert_ne!(key.signing_key_fingerprint(), key.encryption_key_fingerprint());
    }

    #[test]
    fn legacy_contact_key_signs_with_primary() {
        let keyring = testing::generate_legacy_keyring("eve@example.com", None);
        let key = ContactPublicKey::from_bytes(&testing::public_bytes(&keyring)).unwrap();
        assert_eq!(key.signing_key_fingerprint(), &keyring.fingerprint());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ContactPublicKey::from_bytes(b"not a key").is_err());
    }
}
