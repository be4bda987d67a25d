//! `Sealpost` Core Library
//!
//! Shared functionality for `Sealpost` components:
//! - Configuration resolution and hierarchy
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{AccountConfig, CoderConfig, Config, LoggingConfig};
pub use error::{Error, Result};
