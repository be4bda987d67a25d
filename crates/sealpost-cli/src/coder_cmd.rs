//! Encrypt/decrypt subcommands for messages and files.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sealpost_core::CoderConfig;
use sealpost_crypto::{
    Account, Coder, CoderStatus, ContactKeyCache, InAttachment, InMessage, OutMessage,
    is_encrypted_file,
};

use crate::contacts;

/// Encryption subcommand actions.
#[derive(clap::Subcommand, Debug)]
pub enum CoderAction {
    /// Sign and encrypt a text message.
    Encrypt {
        /// Recipient public key files.
        #[arg(short, long = "to", required = true)]
        recipients: Vec<PathBuf>,
        /// Message text. Read from stdin when omitted.
        #[arg(short, long)]
        message: Option<String>,
        /// Output file. Binary ciphertext goes to stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Decrypt and verify a text message.
    Decrypt {
        /// Ciphertext file.
        file: PathBuf,
        #[command(flatten)]
        sender: SenderArgs,
        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Sign and encrypt a file into `encrypted_*` in the attachment directory.
    EncryptFile {
        #[arg(short, long = "to", required = true)]
        recipients: Vec<PathBuf>,
        file: PathBuf,
    },
    /// Decrypt and verify an encrypted file next to itself.
    DecryptFile {
        file: PathBuf,
        #[command(flatten)]
        sender: SenderArgs,
    },
}

#[derive(clap::Args, Debug)]
pub struct SenderArgs {
    /// Sender public key file. Without it signatures stay unverified.
    #[arg(short, long = "from")]
    key: Option<PathBuf>,
    /// Sender address, if it differs from the key's user id.
    #[arg(long = "from-address")]
    address: Option<String>,
}

/// Execute an encryption subcommand.
pub fn run(
    action: CoderAction,
    account: &Account,
    passphrase: Option<&str>,
    config: CoderConfig,
) -> anyhow::Result<()> {
    let key = account.load(passphrase)?;
    let coder = Coder::new(Arc::new(ContactKeyCache::new()), config);

    match action {
        CoderAction::Encrypt {
            recipients,
            message,
            out,
        } => {
            let text = match message {
                Some(text) => text,
                None => {
                    let mut text = String::new();
                    io::stdin().read_to_string(&mut text)?;
                    text
                }
            };
            let mut msg = OutMessage::new(load_recipients(&recipients)?, text);
            let ciphertext = coder
                .encrypt_message(Some(&*key), &mut msg)
                .ok_or_else(|| failure("Encryption", &msg.status))?;
            match out {
                Some(path) => std::fs::write(&path, &ciphertext)
                    .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?,
                None => io::stdout().write_all(&ciphertext)?,
            }
            Ok(())
        }
        CoderAction::Decrypt { file, sender, json } => {
            let ciphertext = std::fs::read(&file)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;
            let sender = contacts::sender_record(sender.key.as_deref(), sender.address.as_deref())?;
            let mut msg = InMessage::encrypted(sender, ciphertext);
            let ok = coder.decrypt_message(Some(&*key), &mut msg);
            let text = msg.content.as_ref().map(|c| c.text().into_owned());

            let mut out = io::stdout();
            if json {
                writeln!(out, "{}", status_json(&msg.status, text.as_deref()))?;
            } else {
                writeln!(out, "Status: {}", msg.status)?;
                if let Some(text) = &text {
                    writeln!(out)?;
                    writeln!(out, "{text}")?;
                }
            }
            if ok {
                Ok(())
            } else {
                Err(failure("Decryption", &msg.status))
            }
        }
        CoderAction::EncryptFile { recipients, file } => {
            let mut msg = OutMessage::new(load_recipients(&recipients)?, "");
            let path = coder
                .encrypt_attachment(Some(&*key), &mut msg, &file)
                .ok_or_else(|| failure("Encryption", &msg.status))?;
            writeln!(io::stdout(), "{}", path.display())?;
            Ok(())
        }
        CoderAction::DecryptFile { file, sender } => {
            let sender = contacts::sender_record(sender.key.as_deref(), sender.address.as_deref())?;
            let mut attachment = InAttachment::encrypted(file);
            let ok = coder.decrypt_attachment(Some(&*key), &mut attachment, &sender);

            let mut out = io::stdout();
            writeln!(out, "Status: {}", attachment.status)?;
            if let Some(path) = &attachment.decrypted_file {
                writeln!(out, "Decrypted: {}", path.display())?;
            }
            if ok {
                Ok(())
            } else {
                Err(failure("Decryption", &attachment.status))
            }
        }
    }
}

fn load_recipients(paths: &[PathBuf]) -> anyhow::Result<Vec<sealpost_crypto::ContactRecord>> {
    paths.iter().map(|p| contacts::record_from_file(p)).collect()
}

fn failure(what: &str, status: &CoderStatus) -> anyhow::Error {
    anyhow::anyhow!("{what} failed: {}", status.errors())
}

fn status_json(status: &CoderStatus, text: Option<&str>) -> serde_json::Value {
    let (encryption, signing, error_mask) = status.to_stored();
    serde_json::json!({
        "encryption": format!("{:?}", status.encryption()),
        "signing": format!("{:?}", status.signing()),
        "errors": status.errors().iter().map(|e| e.as_str()).collect::<Vec<_>>(),
        "stored": [encryption, signing, error_mask],
        "text": text,
    })
}

/// Report whether a file holds an OpenPGP encrypted message.
pub fn probe(file: &Path) -> anyhow::Result<()> {
    let verdict = if is_encrypted_file(file) {
        "encrypted"
    } else {
        "not encrypted"
    };
    writeln!(io::stdout(), "{}: {verdict}", file.display())?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sealpost_crypto::{CoderError, testing};

    #[test]
    fn json_report() {
        let mut status = CoderStatus::received(true);
        status.add_error(CoderError::InvalidPrivateKey);
        let value = status_json(&status, None);
        assert_eq!(value["encryption"], "Encrypted");
        assert_eq!(value["signing"], "Unknown");
        assert_eq!(value["errors"][0], "INVALID_PRIVATE_KEY");
        assert_eq!(value["stored"][2], 1 << 3);
        assert!(value["text"].is_null());
    }

    #[test]
    fn encrypt_file_then_decrypt_file() {
        let dir = tempfile::tempdir().unwrap();

        let alice_cert = testing::generate_keyring("Alice <alice@example.com>", None);
        let alice = Account::open(dir.path().join("alice"));
        alice
            .set_account(&testing::secret_bytes(&alice_cert), None)
            .unwrap();
        let alice_pub = dir.path().join("alice.pgp");
        std::fs::write(&alice_pub, testing::public_bytes(&alice_cert)).unwrap();

        let bob_cert = testing::generate_keyring("Bob <bob@example.com>", None);
        let bob = Account::open(dir.path().join("bob"));
        bob.set_account(&testing::secret_bytes(&bob_cert), None)
            .unwrap();
        let bob_pub = dir.path().join("bob.pgp");
        std::fs::write(&bob_pub, testing::public_bytes(&bob_cert)).unwrap();

        let outbox = dir.path().join("outbox");
        let config = CoderConfig {
            attachment_dir: Some(outbox.clone()),
            ..CoderConfig::default()
        };
        let source = dir.path().join("report.txt");
        std::fs::write(&source, "quarterly numbers").unwrap();

        run(
            CoderAction::EncryptFile {
                recipients: vec![bob_pub],
                file: source,
            },
            &alice,
            None,
            config.clone(),
        )
        .unwrap();

        let encrypted = std::fs::read_dir(&outbox)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| is_encrypted_file(p))
            .unwrap();
        probe(&encrypted).unwrap();
        run(
            CoderAction::DecryptFile {
                file: encrypted.clone(),
                sender: SenderArgs {
                    key: Some(alice_pub),
                    address: None,
                },
            },
            &bob,
            None,
            config,
        )
        .unwrap();

        let name = encrypted.file_name().unwrap().to_string_lossy().into_owned();
        let decrypted = outbox.join(name.trim_start_matches("encrypted_"));
        assert_eq!(std::fs::read_to_string(decrypted).unwrap(), "quarterly numbers");
    }

    #[test]
    fn decrypt_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cert = testing::generate_keyring("Bob <bob@example.com>", None);
        let bob = Account::open(dir.path().join("bob"));
        bob.set_account(&testing::secret_bytes(&cert), None).unwrap();

        let file = dir.path().join("msg.pgp");
        std::fs::write(&file, b"not a message").unwrap();
        let action = CoderAction::Decrypt {
            file,
            sender: SenderArgs {
                key: None,
                address: Some("alice@example.com".into()),
            },
            json: true,
        };
        let err = run(action, &bob, None, CoderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("INVALID_DATA"), "{err}");
    }
}
