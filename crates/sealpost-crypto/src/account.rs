//! Persistence of the personal key and the active-key slot.
//!
//! Layout of the key directory:
//! - `personal-private.asc`: armored secret keyring
//! - `personal-bridge.crt`: bridge certificate, DER
//! - `account.json`: provisional address and system-generated passphrase
//!
//! All files are written atomically with owner-only permissions. Updates
//! touching several files stage every file first and roll back the ones
//! already replaced if a later one cannot be put in place.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::AccountError;
use crate::personal::{self, PersonalKey};

pub const PRIVATE_KEY_FILE: &str = "personal-private.asc";
pub const BRIDGE_CERT_FILE: &str = "personal-bridge.crt";
pub const STATE_FILE: &str = "account.json";

const SYSTEM_PASSPHRASE_LEN: usize = 40;

/// Persisted account metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provisional_address: Option<String>,
    /// Set when the keyring is protected by a passphrase we generated rather
    /// than one the user chose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_passphrase: Option<String>,
}

/// The user's account: key files on disk plus the active [`PersonalKey`].
pub struct Account {
    dir: PathBuf,
    active: RwLock<Option<Arc<PersonalKey>>>,
    // Serializes read-modify-write of the key files.
    io_lock: Mutex<()>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("dir", &self.dir)
            .field("loaded", &self.personal_key().is_some())
            .finish()
    }
}

impl Account {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: RwLock::new(None),
            io_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a private keyring has been imported.
    pub fn is_present(&self) -> bool {
        self.dir.join(PRIVATE_KEY_FILE).is_file()
    }

    /// Whether the keyring is protected by a passphrase the user chose.
    pub fn is_password_protected(&self) -> bool {
        self.is_present()
            && self
                .read_state()
                .is_ok_and(|state| state.system_passphrase.is_none())
    }

    pub fn provisional_address(&self) -> Option<String> {
        self.read_state().ok()?.provisional_address
    }

    /// Snapshot of the active key.
    pub fn personal_key(&self) -> Option<Arc<PersonalKey>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the active key from memory.
    pub fn unload(&self) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Load the stored keyring and make it the active key.
    ///
    /// Without a `passphrase` the stored system passphrase is used, if any.
    pub fn load(&self, passphrase: Option<&str>) -> Result<Arc<PersonalKey>, AccountError> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let keyring_path = self.dir.join(PRIVATE_KEY_FILE);
        let keyring =
            std::fs::read(&keyring_path).map_err(|e| AccountError::read(&keyring_path, e))?;
        let cert_path = self.dir.join(BRIDGE_CERT_FILE);
        let bridge_cert = match std::fs::read(&cert_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(AccountError::read(&cert_path, e)),
        };
        let state = self.read_state()?;

        let passphrase = non_empty(passphrase).or(state.system_passphrase.as_deref());
        let key = PersonalKey::load(&keyring, passphrase, bridge_cert.as_deref())?;
        if bridge_cert.is_none() {
            write_atomic(&cert_path, key.bridge_certificate())?;
        }

        let key = Arc::new(key);
        self.publish(Arc::clone(&key));
        tracing::info!(fingerprint = %key.fingerprint(), "Personal key loaded from disk");
        Ok(key)
    }

    /// Import a secret keyring as the account key.
    ///
    /// The keyring is fully validated first; on success it is stored
    /// re-protected under a generated passphrase and becomes the active key.
    /// Any failure leaves the previous files and active key untouched.
    pub fn set_account(
        &self,
        keyring: &[u8],
        passphrase: Option<&str>,
    ) -> Result<Arc<PersonalKey>, AccountError> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let passphrase = non_empty(passphrase);

        let key = PersonalKey::load(keyring, passphrase, None)
            .map_err(|e| AccountError::ImportKey(e.to_string()))?;
        let system_passphrase = generate_passphrase();
        let stored = personal::reencrypt_keyring(keyring, passphrase, &system_passphrase)
            .map_err(|e| AccountError::ImportKey(e.to_string()))?;

        std::fs::create_dir_all(&self.dir).map_err(|e| AccountError::write(&self.dir, e))?;
        let state = self.encode_state(&AccountState {
            provisional_address: Some(key.address().to_string()),
            system_passphrase: Some(system_passphrase),
        })?;
        // The state carries the passphrase of the new keyring: it goes first.
        let mut update = Update::new(&self.dir);
        update.stage(STATE_FILE, &state)?;
        update.stage(PRIVATE_KEY_FILE, &stored)?;
        update.stage(BRIDGE_CERT_FILE, key.bridge_certificate())?;
        update.commit()?;

        let key = Arc::new(key);
        self.publish(Arc::clone(&key));
        tracing::info!(
            fingerprint = %key.fingerprint(),
            address = %key.address(),
            "Account key imported"
        );
        Ok(key)
    }

    /// Re-protect the stored keyring with a new passphrase.
    ///
    /// A missing `old` passphrase falls back to the stored system one. An
    /// empty `new` passphrase generates one and records it. The in-memory
    /// key is not touched.
    pub fn set_password(&self, old: Option<&str>, new: &str) -> Result<(), AccountError> {
        let _guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let keyring_path = self.dir.join(PRIVATE_KEY_FILE);
        let keyring =
            std::fs::read(&keyring_path).map_err(|e| AccountError::read(&keyring_path, e))?;
        let mut state = self.read_state()?;

        let old = non_empty(old).or(state.system_passphrase.as_deref());
        let (new, system) = if new.is_empty() {
            let generated = generate_passphrase();
            (generated.clone(), Some(generated))
        } else {
            (new.to_string(), None)
        };

        let stored = personal::reencrypt_keyring(&keyring, old, &new).map_err(|e| {
            tracing::warn!(error = %e, "Key password change failed");
            AccountError::ChangePassword(e.to_string())
        })?;

        state.system_passphrase = system;
        let mut update = Update::new(&self.dir);
        update.stage(STATE_FILE, &self.encode_state(&state)?)?;
        update.stage(PRIVATE_KEY_FILE, &stored)?;
        update.commit()?;
        tracing::info!(
            user_chosen = state.system_passphrase.is_none(),
            "Key password changed"
        );
        Ok(())
    }

    fn publish(&self, key: Arc<PersonalKey>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    fn read_state(&self) -> Result<AccountState, AccountError> {
        let path = self.dir.join(STATE_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AccountState::default());
            }
            Err(e) => return Err(AccountError::read(&path, e)),
        };
        serde_json::from_str(&data).map_err(|e| {
            AccountError::read(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    fn encode_state(&self, state: &AccountState) -> Result<Vec<u8>, AccountError> {
        serde_json::to_vec_pretty(state).map_err(|e| {
            AccountError::write(
                self.dir.join(STATE_FILE),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }
}

/// Key directory files replaced together.
struct Update<'a> {
    dir: &'a Path,
    staged: Vec<(PathBuf, NamedTempFile)>,
}

impl<'a> Update<'a> {
    const fn new(dir: &'a Path) -> Self {
        Self {
            dir,
            staged: Vec::new(),
        }
    }

    fn stage(&mut self, name: &str, data: &[u8]) -> Result<(), AccountError> {
        let path = self.dir.join(name);
        let tmp = stage_file(&path, data)?;
        self.staged.push((path, tmp));
        Ok(())
    }

    /// Move the staged files into place in staging order. On failure the
    /// files already replaced get their previous content back; staged
    /// files not yet moved are deleted on drop.
    fn commit(self) -> Result<(), AccountError> {
        let mut replaced: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(self.staged.len());
        for (path, tmp) in self.staged {
            let previous = match std::fs::read(&path) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    rollback(&replaced);
                    return Err(AccountError::write(path, e));
                }
            };
            if let Err(e) = tmp.persist(&path) {
                rollback(&replaced);
                return Err(AccountError::write(path, e.error));
            }
            replaced.push((path, previous));
        }
        Ok(())
    }
}

fn rollback(replaced: &[(PathBuf, Option<Vec<u8>>)]) {
    for (path, previous) in replaced.iter().rev() {
        let restored = match previous {
            Some(bytes) => write_atomic(path, bytes),
            None => std::fs::remove_file(path).map_err(|e| AccountError::write(path, e)),
        };
        match restored {
            Ok(()) => tracing::debug!(path = %path.display(), "Key file restored"),
            Err(e) => tracing::error!(error = %e, "Cannot restore key file"),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

fn generate_passphrase() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SYSTEM_PASSPHRASE_LEN)
        .map(char::from)
        .collect()
}

/// Write via a temp file in the same directory, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), AccountError> {
    stage_file(path, data)?
        .persist(path)
        .map_err(|e| AccountError::write(path, e.error))?;
    Ok(())
}

/// Owner-only temp file next to `path` holding `data`, synced to disk.
fn stage_file(path: &Path, data: &[u8]) -> Result<NamedTempFile, AccountError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| AccountError::write(path, e))?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| AccountError::write(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(|e| AccountError::write(path, e))?;
    }
    Ok(tmp)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::AccountErrorKind;
    use crate::testing;

    fn import(dir: &Path, user: &str, pw: Option<&str>) -> (Account, Arc<PersonalKey>) {
        let account = Account::open(dir);
        let cert = testing::generate_keyring(user, pw);
        let key = account
            .set_account(&testing::secret_armored(&cert), pw)
            .unwrap();
        (account, key)
    }

    #[test]
    fn set_account_persists_and_activates() {
        let dir = tempfile::tempdir().unwrap();
        let (account, key) = import(dir.path(), "Alice <alice@example.com>", Some("pw"));

        assert!(account.is_present());
        assert!(!account.is_password_protected());
        assert_eq!(
            account.provisional_address().as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(
            account.personal_key().unwrap().fingerprint(),
            key.fingerprint()
        );
        let cert = std::fs::read(dir.path().join(BRIDGE_CERT_FILE)).unwrap();
        assert_eq!(cert, key.bridge_certificate());
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        import(dir.path(), "Alice <alice@example.com>", None);
        for name in [PRIVATE_KEY_FILE, BRIDGE_CERT_FILE, STATE_FILE] {
            let mode = std::fs::metadata(dir.path().join(name))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{name}");
        }
    }

    #[test]
    fn reload_uses_system_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key) = import(dir.path(), "Alice <alice@example.com>", Some("pw"));

        let fresh = Account::open(dir.path());
        assert!(fresh.personal_key().is_none());
        let loaded = fresh.load(None).unwrap();
        assert_eq!(loaded.fingerprint(), key.fingerprint());
        assert_eq!(loaded.bridge_certificate(), key.bridge_certificate());
    }

    #[test]
    fn failed_import_keeps_previous_key() {
        let dir = tempfile::tempdir().unwrap();
        let (account, key) = import(dir.path(), "Alice <alice@example.com>", None);

        let other = testing::generate_keyring("Bob <bob@example.com>", Some("right"));
        let err = account
            .set_account(&testing::secret_armored(&other), Some("wrong"))
            .unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::ImportKey);
        assert_eq!(
            account.personal_key().unwrap().fingerprint(),
            key.fingerprint()
        );
        assert_eq!(
            Account::open(dir.path()).load(None).unwrap().fingerprint(),
            key.fingerprint()
        );
    }

    #[test]
    fn set_password_requires_new_passphrase_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let (account, key) = import(dir.path(), "Alice <alice@example.com>", None);

        account.set_password(None, "secret").unwrap();
        assert!(account.is_password_protected());
        // In-memory key is untouched.
        assert_eq!(
            account.personal_key().unwrap().fingerprint(),
            key.fingerprint()
        );

        let fresh = Account::open(dir.path());
        assert_eq!(
            fresh.load(None).unwrap_err().kind(),
            AccountErrorKind::LoadKey
        );
        assert!(fresh.load(Some("secret")).is_ok());
    }

    #[test]
    fn set_password_with_wrong_old_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (account, _) = import(dir.path(), "Alice <alice@example.com>", None);
        account.set_password(None, "first").unwrap();

        let err = account.set_password(Some("nope"), "second").unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::ChangePass);
        assert!(Account::open(dir.path()).load(Some("first")).is_ok());
    }

    #[test]
    fn empty_new_password_is_generated() {
        let dir = tempfile::tempdir().unwrap();
        let (account, _) = import(dir.path(), "Alice <alice@example.com>", None);
        account.set_password(None, "chosen").unwrap();
        account.set_password(Some("chosen"), "").unwrap();

        assert!(!account.is_password_protected());
        assert!(Account::open(dir.path()).load(None).is_ok());
    }

    #[test]
    fn missing_keyring_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::open(dir.path());
        assert!(!account.is_present());
        assert_eq!(
            account.load(None).unwrap_err().kind(),
            AccountErrorKind::ReadFile
        );
        assert_eq!(
            account.set_password(None, "x").unwrap_err().kind(),
            AccountErrorKind::ReadFile
        );
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn unwritable_state_keeps_previous_account() {
        let dir = tempfile::tempdir().unwrap();
        let (account, key) = import(dir.path(), "Alice <alice@example.com>", None);
        let before = dir_names(dir.path());

        let state_path = dir.path().join(STATE_FILE);
        let saved_state = std::fs::read(&state_path).unwrap();
        std::fs::remove_file(&state_path).unwrap();
        std::fs::create_dir(&state_path).unwrap();

        let other = testing::generate_keyring("Bob <bob@example.com>", Some("pw"));
        let err = account
            .set_account(&testing::secret_armored(&other), Some("pw"))
            .unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::WriteFile);
        assert_eq!(
            account.personal_key().unwrap().fingerprint(),
            key.fingerprint()
        );
        assert_eq!(
            account.set_password(None, "chosen").unwrap_err().kind(),
            AccountErrorKind::ReadFile
        );

        std::fs::remove_dir(&state_path).unwrap();
        std::fs::write(&state_path, saved_state).unwrap();
        assert_eq!(dir_names(dir.path()), before);
        assert_eq!(
            Account::open(dir.path()).load(None).unwrap().fingerprint(),
            key.fingerprint()
        );
    }

    #[test]
    fn failed_keyring_write_rolls_back_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(PRIVATE_KEY_FILE)).unwrap();

        let account = Account::open(dir.path());
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let err = account
            .set_account(&testing::secret_bytes(&cert), None)
            .unwrap_err();
        assert_eq!(err.kind(), AccountErrorKind::WriteFile);
        assert!(account.personal_key().is_none());
        assert_eq!(dir_names(dir.path()), vec![PRIVATE_KEY_FILE.to_string()]);
    }

    #[test]
    fn generated_passphrase_is_alphanumeric() {
        let pw = generate_passphrase();
        assert_eq!(pw.len(), SYSTEM_PASSPHRASE_LEN);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
