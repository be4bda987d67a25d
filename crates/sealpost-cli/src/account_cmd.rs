//! Account subcommands: import, passwd, info, export.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sealpost_crypto::Account;

/// Personal key subcommand actions.
#[derive(clap::Subcommand, Debug)]
pub enum AccountAction {
    /// Import a secret keyring as the account key.
    Import {
        /// Secret keyring file (binary or ASCII-armored).
        file: PathBuf,
    },
    /// Change the passphrase protecting the stored keyring.
    Passwd {
        /// Current passphrase. Defaults to `--passphrase`, then the stored one.
        #[arg(long)]
        old: Option<String>,
        /// New passphrase. Empty generates one and stores it.
        #[arg(long, env = "SEALPOST_NEW_PASSPHRASE", default_value = "")]
        new: String,
    },
    /// Show the account key.
    Info,
    /// Write the X.509 bridge certificate (DER) to a file.
    ExportCert {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Write the public keyring to a file.
    ExportPublic {
        #[arg(short, long)]
        out: PathBuf,
    },
}

/// Execute an account subcommand.
pub fn run(
    action: AccountAction,
    account: &Account,
    passphrase: Option<&str>,
) -> anyhow::Result<()> {
    match action {
        AccountAction::Import { file } => import(account, &file, passphrase),
        AccountAction::Passwd { old, new } => passwd(account, old.as_deref().or(passphrase), &new),
        AccountAction::Info => info(account, passphrase),
        AccountAction::ExportCert { out } => {
            let key = account.load(passphrase)?;
            write_export(&out, key.bridge_certificate())
        }
        AccountAction::ExportPublic { out } => {
            let key = account.load(passphrase)?;
            write_export(&out, key.public_keyring())
        }
    }
}

fn import(account: &Account, file: &Path, passphrase: Option<&str>) -> anyhow::Result<()> {
    let keyring = std::fs::read(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;
    let key = account.set_account(&keyring, passphrase)?;

    let mut out = io::stdout();
    writeln!(out, "Imported key {} for {}", key.fingerprint(), key.user_id())?;
    writeln!(out, "Stored in {}", account.dir().display())?;
    Ok(())
}

fn passwd(account: &Account, old: Option<&str>, new: &str) -> anyhow::Result<()> {
    account.set_password(old, new)?;
    let mut out = io::stdout();
    if new.is_empty() {
        writeln!(out, "Passphrase removed; key protected by a generated passphrase")?;
    } else {
        writeln!(out, "Passphrase changed")?;
    }
    Ok(())
}

fn info(account: &Account, passphrase: Option<&str>) -> anyhow::Result<()> {
    let mut out = io::stdout();
    if !account.is_present() {
        writeln!(out, "No account key in {}", account.dir().display())?;
        return Ok(());
    }
    let key = account.load(passphrase)?;
    writeln!(out, "User ID:        {}", key.user_id())?;
    writeln!(out, "Address:        {}", key.address())?;
    writeln!(out, "Fingerprint:    {}", key.fingerprint())?;
    writeln!(out, "Signing key:    {}", key.signing_key_fingerprint().to_hex())?;
    writeln!(out, "Encryption key: {}", key.encryption_key_fingerprint().to_hex())?;
    writeln!(
        out,
        "Passphrase:     {}",
        if account.is_password_protected() {
            "user-chosen"
        } else {
            "generated"
        }
    )?;
    Ok(())
}

fn write_export(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, data)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;
    tracing::info!(path = %path.display(), bytes = data.len(), "Exported");
    writeln!(io::stdout(), "Wrote {}", path.display())?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sealpost_crypto::testing;

    fn imported() -> (tempfile::TempDir, Account) {
        let dir = tempfile::tempdir().unwrap();
        let cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let file = dir.path().join("alice.asc");
        std::fs::write(&file, testing::secret_armored(&cert)).unwrap();

        let account = Account::open(dir.path().join("keys"));
        run(AccountAction::Import { file }, &account, None).unwrap();
        (dir, account)
    }

    #[test]
    fn import_then_export() {
        let (dir, account) = imported();
        assert!(account.is_present());

        let cert_out = dir.path().join("bridge.der");
        run(AccountAction::ExportCert { out: cert_out.clone() }, &account, None).unwrap();
        let key = account.personal_key().unwrap();
        assert_eq!(std::fs::read(cert_out).unwrap(), key.bridge_certificate());

        let pub_out = dir.path().join("alice.pgp");
        run(AccountAction::ExportPublic { out: pub_out.clone() }, &account, None).unwrap();
        assert_eq!(std::fs::read(pub_out).unwrap(), key.public_keyring());
    }

    #[test]
    fn passwd_requires_passphrase_afterwards() {
        let (_dir, account) = imported();
        let action = AccountAction::Passwd {
            old: None,
            new: "s3cret".into(),
        };
        run(action, &account, None).unwrap();
        assert!(account.is_password_protected());
        assert!(run(AccountAction::Info, &account, None).is_err());
        run(AccountAction::Info, &account, Some("s3cret")).unwrap();
    }

    #[test]
    fn import_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::open(dir.path());
        let action = AccountAction::Import {
            file: dir.path().join("nope.asc"),
        };
        assert!(run(action, &account, None).is_err());
        assert!(!account.is_present());
    }
}
