//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The connection string is wrapped in `secrecy::SecretString`
//! so it never lands in logs.

pub mod secrets;
pub mod stale;

pub use stale::StaleTimeouts;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

/// Default number of acquire attempts before reporting "no item".
pub const DEFAULT_ACQUIRE_ATTEMPTS: u32 = 10;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub max_connections: u32,
    pub queue: QueueConfig,
    /// Path to the per-type stale timeout table, if one is configured.
    pub stale_timeouts_path: Option<PathBuf>,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on acquire attempts per call. Always at least 1.
    pub acquire_attempts: u32,
    /// Upper bound of the random pause between acquire attempts. Zero disables it.
    pub retry_jitter: Duration,
    /// Deadline applied to every engine operation.
    pub operation_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            acquire_attempts: DEFAULT_ACQUIRE_ATTEMPTS,
            retry_jitter: Duration::from_millis(5),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = QueueConfig::default();

        let acquire_attempts =
            parsed_var(&lookup, "RELQ_ACQUIRE_ATTEMPTS")?.unwrap_or(defaults.acquire_attempts);
        if acquire_attempts == 0 {
            return Err(Error::Config(
                "RELQ_ACQUIRE_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let retry_jitter = parsed_var(&lookup, "RELQ_RETRY_JITTER_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_jitter);
        let operation_timeout = parsed_var(&lookup, "RELQ_OPERATION_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.operation_timeout);
        if operation_timeout.is_zero() {
            return Err(Error::Config(
                "RELQ_OPERATION_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(required_var(&lookup, "DATABASE_URL")?),
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|v| !v.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            max_connections: parsed_var(&lookup, "RELQ_MAX_CONNECTIONS")?.unwrap_or(10),
            queue: QueueConfig {
                acquire_attempts,
                retry_jitter,
                operation_timeout,
            },
            stale_timeouts_path: lookup("RELQ_STALE_TIMEOUTS").map(PathBuf::from),
        })
    }

    /// The stale timeout table, or the one-day default when none is configured.
    pub fn stale_timeouts(&self) -> Result<StaleTimeouts> {
        match &self.stale_timeouts_path {
            Some(path) => StaleTimeouts::load(path),
            None => Ok(StaleTimeouts::default()),
        }
    }
}

fn required_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    lookup(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}")))
        })
        .transpose()
}
