//! Error types for `Sealpost` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using `Sealpost` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Sealpost` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An explicitly requested config file does not exist.
    #[error("Config file not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("Failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
