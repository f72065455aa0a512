//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The Redis URL may carry a password, so it is wrapped in
//! secrecy::SecretString to keep it out of logs.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub pool_size: usize,
    pub pool_wait: Duration,
    pub claim_retries: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let pool_size = parsed_var("REDEQUE_POOL_SIZE", 50)?;
        if pool_size == 0 {
            return Err(Error::Config("REDEQUE_POOL_SIZE must be at least 1".to_string()));
        }

        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            pool_size,
            pool_wait: Duration::from_millis(parsed_var("REDEQUE_POOL_WAIT_MS", 5000)?),
            claim_retries: parsed_var("REDEQUE_CLAIM_RETRIES", 3)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("environment variable {name} has invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}
