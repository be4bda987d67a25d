//! Sealpost CLI
//!
//! Manage the personal OpenPGP key and encrypt/decrypt messages and files
//! offline, the way the messaging client does.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use sealpost_cli::account_cmd::{self, AccountAction};
use sealpost_cli::coder_cmd::{self, CoderAction};
use sealpost_core::config::load_config;
use sealpost_core::tracing_init::init_tracing;
use sealpost_crypto::Account;

#[derive(Parser, Debug)]
#[command(name = "sealpost")]
#[command(version, about = "End-to-end encryption for Sealpost messages", long_about = None)]
struct Cli {
    /// Config file layered over the global settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the account key files.
    #[arg(long, global = true, env = "SEALPOST_KEY_DIR")]
    key_dir: Option<PathBuf>,

    /// Passphrase of the account key (or of the keyring being imported).
    #[arg(long, global = true, env = "SEALPOST_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Log as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Account(AccountAction),
    #[command(flatten)]
    Coder(CoderAction),
    /// Check whether a file holds an OpenPGP encrypted message.
    Probe { file: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if cli.json_logs {
        config.logging.json = true;
    }
    init_tracing(&config.logging);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "Starting sealpost CLI");

    let key_dir = cli
        .key_dir
        .or_else(|| config.key_dir())
        .ok_or_else(|| anyhow::anyhow!("No key directory. Use --key-dir <path>"))?;
    let account = Account::open(key_dir);
    let passphrase = cli.passphrase.as_deref();

    match cli.command {
        Commands::Account(action) => account_cmd::run(action, &account, passphrase),
        Commands::Coder(action) => coder_cmd::run(action, &account, passphrase, config.coder),
        Commands::Probe { file } => coder_cmd::probe(&file),
    }
}
