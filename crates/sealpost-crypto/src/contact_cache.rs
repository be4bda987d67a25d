//! In-memory cache of correspondents' parsed public keys.
//!
//! Entries are keyed by the correspondent's bare address and stay valid only
//! while their fingerprint matches the one the contact record declares.
//! A mismatch (the contact rotated keys) forces a re-parse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::keys::{self, ContactPublicKey};
use crate::message::Contact;

#[derive(Debug, Default)]
pub struct ContactKeyCache {
    entries: Mutex<HashMap<String, Arc<ContactPublicKey>>>,
}

impl ContactKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the parsed key for `identity`.
    ///
    /// A cached entry whose fingerprint matches `declared_fingerprint` is
    /// returned as-is. Otherwise `raw` is parsed and replaces the entry.
    /// Empty or unparseable bytes yield `None`.
    pub fn resolve(
        &self,
        identity: &str,
        raw: &[u8],
        declared_fingerprint: &str,
    ) -> Option<Arc<ContactPublicKey>> {
        let id = keys::bare_address(identity);
        if let Some(hit) = self
            .lock()
            .get(&id)
            .filter(|entry| keys::fingerprints_match(entry.fingerprint(), declared_fingerprint))
        {
            tracing::trace!(identity = %id, "Contact key cache hit");
            return Some(Arc::clone(hit));
        }

        if raw.is_empty() {
            tracing::debug!(identity = %id, "No public key for contact");
            return None;
        }

        // Parsing happens outside the lock; racing callers may both parse.
        let key = match ContactPublicKey::from_bytes(raw) {
            Ok(key) => Arc::new(key),
            Err(e) => {
                tracing::warn!(identity = %id, error = %e, "Unparseable contact public key");
                return None;
            }
        };
        if !keys::fingerprints_match(key.fingerprint(), declared_fingerprint) {
            tracing::debug!(
                identity = %id,
                declared = %declared_fingerprint,
                actual = %key.fingerprint(),
                "Declared fingerprint does not match key"
            );
        }

        tracing::debug!(identity = %id, fingerprint = %key.fingerprint(), "Contact key cached");
        self.lock().insert(id, Arc::clone(&key));
        Some(key)
    }

    /// [`resolve`](Self::resolve) through a contact record.
    pub fn resolve_contact(&self, contact: &dyn Contact) -> Option<Arc<ContactPublicKey>> {
        self.resolve(contact.address(), contact.public_key(), contact.fingerprint())
    }

    /// Cached entry without validation.
    pub fn get(&self, identity: &str) -> Option<Arc<ContactPublicKey>> {
        self.lock().get(&keys::bare_address(identity)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Fingerprint a contact record should declare for `raw`.
    pub fn fingerprint_of(raw: &[u8]) -> Option<String> {
        if raw.is_empty() {
            return None;
        }
        ContactPublicKey::from_bytes(raw)
            .ok()
            .map(|key| key.fingerprint().to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ContactPublicKey>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::ContactRecord;
    use crate::testing;

    #[test]
    fn matching_fingerprint_is_a_hit() {
        let cache = ContactKeyCache::new();
        let cert = testing::generate_keyring("Bob <bob@example.com>", None);
        let raw = testing::public_bytes(&cert);
        let fpr = ContactKeyCache::fingerprint_of(&raw).unwrap();

        let first = cache.resolve("bob@example.com", &raw, &fpr).unwrap();
        // Same fingerprint, bytes not even needed.
        let second = cache.resolve("Bob@Example.com/phone", &[], &fpr.to_uppercase()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fingerprint_change_forces_reparse() {
        let cache = ContactKeyCache::new();
        let old = testing::generate_keyring("Bob <bob@example.com>", None);
        let new = testing::generate_keyring("Bob <bob@example.com>", None);
        let old_raw = testing::public_bytes(&old);
        let new_raw = testing::public_bytes(&new);

        let old_fpr = ContactKeyCache::fingerprint_of(&old_raw).unwrap();
        let first = cache.resolve("bob@example.com", &old_raw, &old_fpr).unwrap();
        let new_fpr = ContactKeyCache::fingerprint_of(&new_raw).unwrap();
        let second = cache.resolve("bob@example.com", &new_raw, &new_fpr).unwrap();

        assert_ne!(first.fingerprint(), second.fingerprint());
        assert_eq!(second.fingerprint(), new_fpr);
        assert_eq!(cache.get("bob@example.com").unwrap().fingerprint(), new_fpr);
    }

    #[test]
    fn empty_or_garbage_bytes_resolve_to_none() {
        let cache = ContactKeyCache::new();
        assert!(cache.resolve("x@example.com", &[], "abcd").is_none());
        assert!(cache.resolve("x@example.com", b"garbage", "abcd").is_none());
        assert!(cache.is_empty());
        assert_eq!(ContactKeyCache::fingerprint_of(b""), None);
    }

    #[test]
    fn resolve_contact_uses_record() {
        let cache = ContactKeyCache::new();
        let cert = testing::generate_keyring("Bob <bob@example.com>", None);
        let record = ContactRecord::new("bob@example.com", testing::public_bytes(&cert));
        let key = cache.resolve_contact(&record).unwrap();
        assert_eq!(key.fingerprint(), record.fingerprint);
        assert!(cache.resolve_contact(&ContactRecord::without_key("eve@example.com")).is_none());
    }

    #[test]
    fn concurrent_resolves_share_one_entry() {
        let cache = Arc::new(ContactKeyCache::new());
        let cert = testing::generate_keyring("Bob <bob@example.com>", None);
        let raw = Arc::new(testing::public_bytes(&cert));
        let fpr = ContactKeyCache::fingerprint_of(&raw).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let raw = Arc::clone(&raw);
                let fpr = fpr.clone();
                std::thread::spawn(move || {
                    cache
                        .resolve("bob@example.com", &raw, &fpr)
                        .map(|k| k.fingerprint().to_string())
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().as_deref(), Some(fpr.as_str()));
        }
        assert_eq!(cache.len(), 1);
    }
}
