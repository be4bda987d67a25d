//! Keyring generators for tests.
//!
//! Only compiled for unit tests or with the `test-utils` feature.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]

use std::io::Write;

use openpgp::armor::{Kind as ArmorKind, Writer as ArmorWriter};
use openpgp::cert::prelude::*;
use openpgp::crypto::symmetric::{BlockCipherMode, Encryptor as CfbEncryptor, PaddingMode};
use openpgp::crypto::{KeyPair, SessionKey};
use openpgp::packet::header::{BodyLength, CTB};
use openpgp::packet::prelude::*;
use openpgp::packet::signature::SignatureBuilder;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Encryptor, LiteralWriter, Message, Signer};
use openpgp::serialize::{Serialize, SerializeInto};
use openpgp::types::{DataFormat, KeyFlags, SignatureType, SymmetricAlgorithm};
use rand::RngCore;
use sequoia_openpgp as openpgp;

/// Generate a keyring with the layout the personal key manager expects:
/// certification+authentication primary, signing subkey, encryption subkey.
pub fn generate_keyring(user_id: &str, password: Option<&str>) -> Cert {
    let (cert, _rev) = CertBuilder::new()
        .add_userid(user_id)
        .set_cipher_suite(CipherSuite::Cv25519)
        .set_primary_key_flags(
            KeyFlags::empty()
                .set_certification()
                .set_authentication(),
        )
        .add_signing_subkey()
        .add_transport_encryption_subkey()
        .set_password(password.map(Into::into))
        .generate()
        .expect("keyring generation");
    cert
}

/// Generate a legacy keyring whose primary key also signs.
pub fn generate_legacy_keyring(user_id: &str, password: Option<&str>) -> Cert {
    let (cert, _rev) = CertBuilder::new()
        .add_userid(user_id)
        .set_cipher_suite(CipherSuite::Cv25519)
        .set_primary_key_flags(
            KeyFlags::empty()
                .set_certification()
                .set_signing()
                .set_authentication(),
        )
        .add_transport_encryption_subkey()
        .set_password(password.map(Into::into))
        .generate()
        .expect("keyring generation");
    cert
}

/// Generate a keyring with no encryption-capable key.
pub fn generate_signing_only_keyring(user_id: &str) -> Cert {
    let (cert, _rev) = CertBuilder::new()
        .add_userid(user_id)
        .set_cipher_suite(CipherSuite::Cv25519)
        .set_primary_key_flags(
            KeyFlags::empty()
                .set_certification()
                .set_authentication(),
        )
        .add_signing_subkey()
        .generate()
        .expect("keyring generation");
    cert
}

/// Binary public keyring.
pub fn public_bytes(cert: &Cert) -> Vec<u8> {
    cert.to_vec().expect("serialize public keyring")
}

/// ASCII-armored secret keyring, as it would be imported.
pub fn secret_armored(cert: &Cert) -> Vec<u8> {
    let mut writer = ArmorWriter::new(Vec::new(), ArmorKind::SecretKey).expect("armor writer");
    cert.as_tsk()
        .serialize(&mut writer)
        .expect("serialize secret keyring");
    writer.finalize().expect("finalize armor")
}

/// Binary secret keyring.
pub fn secret_bytes(cert: &Cert) -> Vec<u8> {
    cert.as_tsk().to_vec().expect("serialize secret keyring")
}

fn signing_keypair(cert: &Cert) -> KeyPair {
    let policy = StandardPolicy::new();
    cert.keys()
        .with_policy(&policy, None)
        .secret()
        .for_signing()
        .next()
        .expect("signing key")
        .key()
        .clone()
        .into_keypair()
        .expect("unencrypted signing key")
}

fn encryption_key(cert: &Cert) -> Key<key::PublicParts, key::UnspecifiedRole> {
    let policy = StandardPolicy::new();
    cert.keys()
        .with_policy(&policy, None)
        .for_transport_encryption()
        .next()
        .expect("encryption key")
        .key()
        .clone()
}

/// `payload` signed by `signer` and encrypted for `recipient` in a legacy
/// Symmetrically Encrypted Data packet, which carries no MDC.
pub fn legacy_unprotected(signer: &Cert, recipient: &Cert, payload: &[u8]) -> Vec<u8> {
    let mut signed = Vec::new();
    let message = Message::new(&mut signed);
    let message = Signer::new(message, signing_keypair(signer))
        .expect("signer")
        .build()
        .expect("signer");
    let mut message = LiteralWriter::new(message).build().expect("literal writer");
    message.write_all(payload).expect("write payload");
    message.finalize().expect("finalize signed message");

    let algo = SymmetricAlgorithm::AES256;
    let session_key = SessionKey::new(algo.key_size().expect("key size")).expect("session key");
    let pkesk = PKESK3::for_recipient(algo, &session_key, &encryption_key(recipient))
        .expect("wrap session key");

    let block = algo.block_size().expect("block size");
    let mut prefix = vec![0; block + 2];
    rand::thread_rng().fill_bytes(&mut prefix[..block]);
    prefix[block] = prefix[block - 2];
    prefix[block + 1] = prefix[block - 1];

    let mut body = cfb(algo, &session_key, None, &prefix);
    let iv = body[2..].to_vec();
    body.extend(cfb(algo, &session_key, Some(&iv), &signed));

    let mut out = Vec::new();
    Packet::from(pkesk).serialize(&mut out).expect("serialize PKESK");
    let length = u32::try_from(body.len()).expect("body length");
    let header = Header::new(CTB::new(Tag::SED), BodyLength::Full(length));
    openpgp::serialize::Marshal::serialize(&header, &mut out).expect("serialize header");
    out.extend_from_slice(&body);
    out
}

fn cfb(algo: SymmetricAlgorithm, key: &SessionKey, iv: Option<&[u8]>, data: &[u8]) -> Vec<u8> {
    let mut encryptor =
        CfbEncryptor::new(algo, BlockCipherMode::CFB, PaddingMode::None, key, iv, Vec::new())
            .expect("CFB encryptor");
    encryptor.write_all(data).expect("CFB encrypt");
    encryptor.finalize().expect("CFB finalize")
}

/// `payload` encrypted for `recipient` and signed by `signer`, but the
/// signature lacks its mandatory creation time subpacket.
pub fn signed_without_creation_time(signer: &Cert, recipient: &Cert, payload: &[u8]) -> Vec<u8> {
    let mut keypair = signing_keypair(signer);
    let signature = SignatureBuilder::new(SignatureType::Binary)
        .suppress_signature_creation_time()
        .expect("suppress creation time")
        .sign_message(&mut keypair, payload)
        .expect("sign payload");
    let mut ops = OnePassSig::try_from(&signature).expect("one-pass signature");
    ops.set_last(true);
    let mut literal = Literal::new(DataFormat::Binary);
    literal.set_body(payload.to_vec());

    let policy = StandardPolicy::new();
    let recipients = recipient
        .keys()
        .with_policy(&policy, None)
        .for_transport_encryption();
    let mut out = Vec::new();
    let message = Message::new(&mut out);
    let mut message = Encryptor::for_recipients(message, recipients)
        .build()
        .expect("encryptor");
    for packet in [Packet::from(ops), Packet::from(literal), Packet::from(signature)] {
        packet.serialize(&mut message).expect("write packet");
    }
    message.finalize().expect("finalize message");
    out
}
