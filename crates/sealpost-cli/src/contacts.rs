//! Contact records built from public key files on disk.

use std::path::Path;

use sealpost_crypto::{ContactPublicKey, ContactRecord};

/// Read a public keyring file and file it under the address in its user id.
pub fn record_from_file(path: &Path) -> anyhow::Result<ContactRecord> {
    let raw = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let key = ContactPublicKey::from_bytes(&raw)
        .map_err(|e| anyhow::anyhow!("{} is not a usable public key: {}", path.display(), e))?;
    let address = key
        .address()
        .ok_or_else(|| anyhow::anyhow!("{} has no user id address", path.display()))?
        .to_string();
    Ok(ContactRecord::new(address, raw))
}

/// Sender record: from a key file when given, otherwise a keyless record
/// so the signature ends up unverifiable instead of failing.
pub fn sender_record(
    key_file: Option<&Path>,
    address: Option<&str>,
) -> anyhow::Result<ContactRecord> {
    match key_file {
        Some(path) => {
            let mut record = record_from_file(path)?;
            if let Some(address) = address {
                record.address = address.to_string();
            }
            Ok(record)
        }
        None => Ok(ContactRecord::without_key(address.unwrap_or_default())),
    }
}
