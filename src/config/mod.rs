//! Typed configuration from environment variables.
//!
//! Loaded once at startup; missing or malformed values fail fast. The
//! database URL carries credentials and is kept in a `SecretString`.

pub mod stacks;

pub use stacks::{StackDefinition, StackRegistry};

use crate::error::{Error, Result};
use secrecy::SecretString;

/// Reader slots per key when `MAX_READERS` is unset.
pub const DEFAULT_MAX_READERS: u32 = 8;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Reader capacity of the read / write lock.
    pub max_readers: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_readers: max_readers()?,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn max_readers() -> Result<u32> {
    let Ok(raw) = std::env::var("MAX_READERS") else {
        return Ok(DEFAULT_MAX_READERS);
    };
    match raw.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(Error::Config(format!(
            "MAX_READERS must be a positive integer, got {raw:?}"
        ))),
    }
}
