//! Setup/IO error types.
//!
//! Per-message outcomes are never errors; they are recorded in
//! [`CoderStatus`](crate::status::CoderStatus) instead.

use std::fmt;
use std::path::PathBuf;

/// Coarse classification of an [`AccountError`], as reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountErrorKind {
    LoadKey,
    ImportKey,
    ChangePass,
    ReadFile,
    WriteFile,
}

impl fmt::Display for AccountErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoadKey => "LOAD_KEY",
            Self::ImportKey => "IMPORT_KEY",
            Self::ChangePass => "CHANGE_PASS",
            Self::ReadFile => "READ_FILE",
            Self::WriteFile => "WRITE_FILE",
        };
        f.write_str(s)
    }
}

/// Errors from loading, importing or re-protecting the personal key.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("Failed to load personal key: {0}")]
    LoadKey(String),

    #[error("Failed to import personal key: {0}")]
    ImportKey(String),

    #[error("Failed to change key password: {0}")]
    ChangePassword(String),

    #[error("Failed to read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AccountError {
    pub const fn kind(&self) -> AccountErrorKind {
        match self {
            Self::LoadKey(_) => AccountErrorKind::LoadKey,
            Self::ImportKey(_) => AccountErrorKind::ImportKey,
            Self::ChangePassword(_) => AccountErrorKind::ChangePass,
            Self::ReadFile { .. } => AccountErrorKind::ReadFile,
            Self::WriteFile { .. } => AccountErrorKind::WriteFile,
        }
    }

    pub(crate) fn load(err: impl fmt::Display) -> Self {
        Self::LoadKey(err.to_string())
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteFile {
            path: path.into(),
            source,
        }
    }
}
