//! Configuration resolution for Sealpost.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/sealpost/settings.json)
//! 3. Explicit config file (e.g. `--config` on the command line)
//! 4. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default number of plaintext bytes the decryptor may hold back while it
/// waits for trailing signatures and integrity checks.
pub const DEFAULT_DECRYPT_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Complete Sealpost configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub coder: CoderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the personal key material lives.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccountConfig {
    /// Directory holding the private keyring, bridge certificate and account state.
    pub key_dir: Option<PathBuf>,
}

/// Settings for the encryption/decryption pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoderConfig {
    /// Also encrypt outgoing data for our own key, so sent items stay readable.
    pub encrypt_to_self: bool,
    /// Plaintext buffered by the decryptor before it is released to the caller.
    pub decrypt_buffer_bytes: usize,
    /// Directory for encrypted attachment files. Defaults to the system temp dir.
    pub attachment_dir: Option<PathBuf>,
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            encrypt_to_self: true,
            decrypt_buffer_bytes: DEFAULT_DECRYPT_BUFFER_BYTES,
            attachment_dir: None,
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "sealpost=info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Key directory from config, falling back to the platform default.
    pub fn key_dir(&self) -> Option<PathBuf> {
        self.account.key_dir.clone().or_else(default_key_dir)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|p| p.exists());
    resolve(global.as_deref(), explicit, |key| std::env::var(key).ok())
}

fn resolve(
    global: Option<&Path>,
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = global {
        load_config_file(path)?.apply_to(&mut config);
        tracing::debug!(path = %path.display(), "Applied global config");
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        load_config_file(path)?.apply_to(&mut config);
        tracing::debug!(path = %path.display(), "Applied config file");
    }

    apply_env_overrides(&mut config, lookup);

    Ok(config)
}

/// Base directory for Sealpost state on this platform.
fn base_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".sealpost"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/sealpost"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("sealpost"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    base_dir().map(|d| d.join("settings.json"))
}

/// Get the default key directory.
pub fn default_key_dir() -> Option<PathBuf> {
    base_dir().map(|d| d.join("keys"))
}

/// A config file as written: each field overrides the lower layers only
/// when the file sets it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    account: AccountLayer,
    coder: CoderLayer,
    logging: LoggingLayer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AccountLayer {
    key_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CoderLayer {
    encrypt_to_self: Option<bool>,
    decrypt_buffer_bytes: Option<usize>,
    attachment_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingLayer {
    level: Option<String>,
    json: Option<bool>,
}

impl ConfigFile {
    fn apply_to(self, config: &mut Config) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }
        if self.account.key_dir.is_some() {
            config.account.key_dir = self.account.key_dir;
        }
        set(&mut config.coder.encrypt_to_self, self.coder.encrypt_to_self);
        set(
            &mut config.coder.decrypt_buffer_bytes,
            self.coder.decrypt_buffer_bytes,
        );
        if self.coder.attachment_dir.is_some() {
            config.coder.attachment_dir = self.coder.attachment_dir;
        }
        set(&mut config.logging.level, self.logging.level);
        set(&mut config.logging.json, self.logging.json);
    }
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("SEALPOST_KEY_DIR") {
        config.account.key_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("SEALPOST_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(b) = lookup("SEALPOST_LOG_JSON").as_deref().and_then(parse_bool) {
        config.logging.json = b;
    }
    if let Some(b) = lookup("SEALPOST_ENCRYPT_TO_SELF")
        .as_deref()
        .and_then(parse_bool)
    {
        config.coder.encrypt_to_self = b;
    }
    if let Some(val) = lookup("SEALPOST_ATTACHMENT_DIR") {
        config.coder.attachment_dir = Some(PathBuf::from(val));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_encrypts_to_self() {
        let config = Config::default();
        assert!(config.coder.encrypt_to_self);
        assert_eq!(
            config.coder.decrypt_buffer_bytes,
            DEFAULT_DECRYPT_BUFFER_BYTES
        );
        assert!(!config.logging.json);
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "coder": { "encrypt_to_self": false } }"#).unwrap();

        let config = resolve(None, Some(&path), no_env).unwrap();
        assert!(!config.coder.encrypt_to_self);
        assert_eq!(
            config.coder.decrypt_buffer_bytes,
            DEFAULT_DECRYPT_BUFFER_BYTES
        );
        assert_eq!(config.logging.level, "sealpost=info");
    }

    #[test]
    fn explicit_file_only_overrides_what_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("settings.json");
        std::fs::write(
            &global,
            r#"{
                "account": { "key_dir": "/global/keys" },
                "coder": { "encrypt_to_self": false, "attachment_dir": "/global/files" },
                "logging": { "level": "sealpost=debug" }
            }"#,
        )
        .unwrap();
        let explicit = dir.path().join("work.json");
        std::fs::write(
            &explicit,
            r#"{ "account": { "key_dir": "/work/keys" }, "logging": { "json": true } }"#,
        )
        .unwrap();

        let config = resolve(Some(&global), Some(&explicit), no_env).unwrap();
        assert_eq!(config.account.key_dir, Some(PathBuf::from("/work/keys")));
        assert!(!config.coder.encrypt_to_self);
        assert_eq!(
            config.coder.attachment_dir,
            Some(PathBuf::from("/global/files"))
        );
        assert_eq!(
            config.coder.decrypt_buffer_bytes,
            DEFAULT_DECRYPT_BUFFER_BYTES
        );
        assert_eq!(config.logging.level, "sealpost=debug");
        assert!(config.logging.json);

        let config = resolve(Some(&global), None, |k| {
            (k == "SEALPOST_ENCRYPT_TO_SELF").then(|| "on".to_string())
        })
        .unwrap();
        assert!(config.coder.encrypt_to_self);
        assert_eq!(config.account.key_dir, Some(PathBuf::from("/global/keys")));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("SEALPOST_KEY_DIR", "/tmp/sealpost-keys"),
            ("SEALPOST_LOG_JSON", "yes"),
            ("SEALPOST_ENCRYPT_TO_SELF", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(
            config.account.key_dir,
            Some(PathBuf::from("/tmp/sealpost-keys"))
        );
        assert!(config.logging.json);
        assert!(!config.coder.encrypt_to_self);
    }

    #[test]
    fn invalid_bool_env_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| {
            (k == "SEALPOST_ENCRYPT_TO_SELF").then(|| "maybe".to_string())
        });
        assert!(config.coder.encrypt_to_self);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = load_config(Some(Path::new("/nonexistent/sealpost.json")));
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }

    #[test]
    fn corrupted_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_config_file(&path),
            Err(Error::ConfigParse { .. })
        ));
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            load_config_file(&missing),
            Err(Error::ConfigRead { .. })
        ));
    }
}
