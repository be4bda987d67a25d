//! Sealpost CLI Library
//!
//! Command implementations for the `sealpost` binary: personal key
//! management and offline encryption/decryption of messages and files.

pub mod account_cmd;
pub mod coder_cmd;
pub mod contacts;
