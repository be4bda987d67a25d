//! Sign-then-encrypt.

use std::io::{self, Read, Write};
use std::sync::Arc;

use openpgp::Fingerprint;
use openpgp::cert::prelude::*;
use openpgp::policy::Policy;
use openpgp::serialize::stream::{Encryptor, LiteralWriter, Message, Recipient, Signer};
use sequoia_openpgp as openpgp;

use crate::keys::{self, ContactPublicKey};
use crate::personal::PersonalKey;

/// Encryption subkey of `cert` with fingerprint `fpr`, if still valid.
fn recipient_for<'a>(
    cert: &'a Cert,
    fpr: &Fingerprint,
    policy: &'a dyn Policy,
) -> anyhow::Result<Recipient<'a>> {
    cert.keys()
        .with_policy(policy, None)
        .supported()
        .alive()
        .revoked(false)
        .key_flags(keys::encryption_flags())
        .find(|ka| ka.key().fingerprint() == *fpr)
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("encryption key {fpr} is no longer valid"))
}

/// Sign `input` with our signing key and encrypt it for every recipient
/// (and ourselves when `encrypt_to_self`), writing the binary OpenPGP
/// message to `sink`. Integrity protected; streams in bounded memory.
pub(crate) fn sign_and_encrypt<W>(
    my_key: &PersonalKey,
    recipients: &[Arc<ContactPublicKey>],
    encrypt_to_self: bool,
    input: &mut dyn Read,
    sink: W,
) -> anyhow::Result<u64>
where
    W: Write + Send + Sync,
{
    let policy = keys::policy();
    let mut recipient_keys = Vec::with_capacity(recipients.len() + 1);
    for contact in recipients {
        recipient_keys.push(recipient_for(
            contact.cert(),
            contact.encryption_key_fingerprint(),
            &policy,
        )?);
    }
    if encrypt_to_self {
        recipient_keys.push(recipient_for(
            my_key.cert(),
            &my_key.encryption_key_fingerprint(),
            &policy,
        )?);
    }
    anyhow::ensure!(!recipient_keys.is_empty(), "no recipients");

    let message = Message::new(sink);
    let message = Encryptor::for_recipients(message, recipient_keys).build()?;
    let message = Signer::new(message, my_key.signer()?)?.build()?;
    let mut message = LiteralWriter::new(message).build()?;
    let written = io::copy(input, &mut message)?;
    message.finalize()?;
    Ok(written)
}
