//! X.509 bridge certificate and login key.
//!
//! The transport layer authenticates with TLS client certificates, not
//! OpenPGP keys. The bridge is a self-signed X.509 certificate whose subject
//! key is the OpenPGP authentication key, carrying the public keyring in a
//! private extension so the server can tie the TLS identity back to it.

use openpgp::crypto::mpi;
use openpgp::packet::Key;
use openpgp::packet::key::{KeyParts, KeyRole, SecretKeyMaterial, SecretParts, UnspecifiedRole};
use openpgp::types::Curve;
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, CustomExtension, DnType, ExtendedKeyUsagePurpose, KeyPair, SanType,
    SerialNumber,
};
use sequoia_openpgp as openpgp;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::keys::UserId;

/// OID of the extension carrying the OpenPGP public keyring.
pub const PUBLIC_KEYRING_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 3029, 3, 1];

/// PKCS#8 v1 header for a 32-byte Ed25519 seed (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// Bridge certificate errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Unsupported authentication key: {0}")]
    UnsupportedKey(String),

    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Invalid bridge certificate: {0}")]
    Parse(String),

    #[error("Bridge certificate does not match the authentication key")]
    KeyMismatch,
}

/// Raw 32-byte Ed25519 public key of an OpenPGP key.
pub(crate) fn ed25519_public<P: KeyParts, R: KeyRole>(
    key: &Key<P, R>,
) -> Result<[u8; 32], BridgeError> {
    match key.mpis() {
        mpi::PublicKey::EdDSA { curve, q } if *curve == Curve::Ed25519 => {
            let (x, _) = q
                .decode_point(curve)
                .map_err(|e| BridgeError::UnsupportedKey(e.to_string()))?;
            x.try_into()
                .map_err(|_| BridgeError::UnsupportedKey("bad Ed25519 point".into()))
        }
        mpi::PublicKey::Ed25519 { a } => Ok(*a),
        other => Err(BridgeError::UnsupportedKey(format!(
            "{:?}",
            other.algo()
        ))),
    }
}

/// PKCS#8 DER of an unencrypted Ed25519 authentication key.
pub(crate) fn login_key_pkcs8(
    key: &Key<SecretParts, UnspecifiedRole>,
) -> Result<Zeroizing<Vec<u8>>, BridgeError> {
    let SecretKeyMaterial::Unencrypted(secret) = key.secret() else {
        return Err(BridgeError::UnsupportedKey(
            "authentication key is still encrypted".into(),
        ));
    };
    let seed = secret.map(|mpis| match mpis {
        mpi::SecretKeyMaterial::EdDSA { scalar } => {
            let value = scalar.value();
            (value.len() <= 32).then(|| {
                // MPIs drop leading zeroes.
                let mut seed = Zeroizing::new([0u8; 32]);
                seed[32 - value.len()..].copy_from_slice(value);
                seed
            })
        }
        mpi::SecretKeyMaterial::Ed25519 { x } => <[u8; 32]>::try_from(&x[..])
            .ok()
            .map(Zeroizing::new),
        _ => None,
    });
    let seed = seed.ok_or_else(|| {
        BridgeError::UnsupportedKey(format!("{:?} is not Ed25519", key.pk_algo()))
    })?;

    let mut der = Zeroizing::new(Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + 32));
    der.extend_from_slice(&ED25519_PKCS8_PREFIX);
    der.extend_from_slice(seed.as_ref());
    Ok(der)
}

/// Derive a self-signed bridge certificate, returned as DER.
pub(crate) fn derive_certificate(
    login_key: &[u8],
    public_keyring: &[u8],
    user_id: &UserId,
    fingerprint: &[u8],
) -> Result<Vec<u8>, BridgeError> {
    let key_pair =
        KeyPair::try_from(login_key).map_err(|e| BridgeError::Generation(e.to_string()))?;

    let mut params = CertificateParams::default();
    let common_name = if user_id.name.is_empty() {
        user_id.address()
    } else {
        user_id.name.as_str()
    };
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    if let Some(email) = &user_id.email {
        let email = Ia5String::try_from(email.as_str())
            .map_err(|e| BridgeError::Generation(e.to_string()))?;
        params.subject_alt_names.push(SanType::Rfc822Name(email));
    }
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params.custom_extensions.push(CustomExtension::from_oid_content(
        PUBLIC_KEYRING_OID,
        public_keyring.to_vec(),
    ));

    let mut serial: Vec<u8> = fingerprint.iter().take(16).copied().collect();
    if let Some(first) = serial.first_mut() {
        *first &= 0x7f;
    }
    params.serial_number = Some(SerialNumber::from(serial));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| BridgeError::Generation(e.to_string()))?;
    Ok(cert.der().to_vec())
}

/// Accept a stored or supplied bridge certificate (DER or PEM) if its subject
/// key is the authentication key. Returns the DER bytes.
pub(crate) fn load_certificate(bytes: &[u8], auth_public: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let der = if bytes.trim_ascii_start().starts_with(b"-----BEGIN") {
        let (_, pem) = x509_parser::pem::parse_x509_pem(bytes)
            .map_err(|e| BridgeError::Parse(e.to_string()))?;
        pem.contents
    } else {
        bytes.to_vec()
    };

    let matches = {
        let (_, cert) =
            parse_x509_certificate(&der).map_err(|e| BridgeError::Parse(e.to_string()))?;
        cert.public_key().subject_public_key.data.as_ref() == auth_public
    };
    if !matches {
        return Err(BridgeError::KeyMismatch);
    }
    Ok(der)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use openpgp::cert::prelude::*;

    fn auth_key(cert: &Cert) -> Key<SecretParts, UnspecifiedRole> {
        cert.primary_key()
            .key()
            .clone()
            .parts_into_secret()
            .unwrap()
            .role_into_unspecified()
    }

    fn bridge_for(cert: &Cert) -> Vec<u8> {
        let login = login_key_pkcs8(&auth_key(cert)).unwrap();
        let uid = UserId::parse("Alice <alice@example.com>");
        derive_certificate(
            &login,
            &testing::public_bytes(cert),
            &uid,
            cert.fingerprint().as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn login_key_is_pkcs8_ed25519() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let der = login_key_pkcs8(&auth_key(&cert)).unwrap();
        assert_eq!(der.len(), 48);
        assert_eq!(&der[..16], &ED25519_PKCS8_PREFIX);
    }

    #[test]
    fn derived_certificate_binds_auth_key() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let der = bridge_for(&cert);
        let public = ed25519_public(cert.primary_key().key()).unwrap();

        let (_, x509) = parse_x509_certificate(&der).unwrap();
        assert_eq!(
            x509.public_key().subject_public_key.data.as_ref(),
            public.as_slice()
        );
        let eku = x509.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.client_auth);
        assert!(
            x509.extensions()
                .iter()
                .any(|ext| ext.oid.to_id_string() == "1.3.6.1.4.1.3029.3.1")
        );
        assert!(x509.subject().to_string().contains("CN=Alice"));
    }

    #[test]
    fn supplied_pem_is_accepted() {
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let der = bridge_for(&cert);
        let public = ed25519_public(cert.primary_key().key()).unwrap();

        let pem = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            STANDARD.encode(&der)
        );
        assert_eq!(load_certificate(pem.as_bytes(), &public).unwrap(), der);
        assert_eq!(load_certificate(&der, &public).unwrap(), der);
    }

    #[test]
    fn mismatching_certificate_is_rejected() {
        let alice = testing::generate_keyring("Alice <alice@example.com>", None);
        let bob = testing::generate_keyring("Bob <bob@example.com>", None);
        let der = bridge_for(&alice);
        let bob_public = ed25519_public(bob.primary_key().key()).unwrap();
        assert!(matches!(
            load_certificate(&der, &bob_public),
            Err(BridgeError::KeyMismatch)
        ));
        assert!(matches!(
            load_certificate(b"junk", &bob_public),
            Err(BridgeError::Parse(_))
        ));
    }
}
