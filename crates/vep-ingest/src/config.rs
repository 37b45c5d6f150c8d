//! Ingestion configuration
//!
//! Engine tuning for batching, error tolerance, retries and concurrency.
//! Values come from `VEP_*` environment variables (optionally via a `.env`
//! file loaded by the binary) or from JSON, falling back to the defaults
//! below.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::mapping::UnmappedColumnPolicy;

/// Rows per transactional write
pub const DEFAULT_BATCH_SIZE: usize = 5000;
/// Fraction of rejected rows at which a file fails
pub const DEFAULT_MAX_ERROR_RATE: f64 = 0.05;
/// Rows read before the error rate is first evaluated
pub const DEFAULT_ERROR_RATE_MIN_ROWS: u64 = 1000;
/// Rejected rows kept verbatim in a file summary
pub const DEFAULT_MAX_REPORTED_REJECTIONS: usize = 10;
pub const DEFAULT_MAX_FLUSH_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 120;
/// Mapped rows buffered between the reader task and the writer
pub const DEFAULT_READ_AHEAD_ROWS: usize = 10_000;
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 4;

/// Engine configuration shared by every pipeline of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub unmapped_columns: UnmappedColumnPolicy,
    pub max_error_rate: f64,
    pub error_rate_min_rows: u64,
    pub max_reported_rejections: usize,
    pub max_flush_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub flush_timeout_secs: u64,
    pub read_ahead_rows: usize,
    pub max_concurrent_files: usize,
    /// Keep going after a file fails (schema drift always stops the run)
    pub continue_on_error: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            unmapped_columns: UnmappedColumnPolicy::Strict,
            max_error_rate: DEFAULT_MAX_ERROR_RATE,
            error_rate_min_rows: DEFAULT_ERROR_RATE_MIN_ROWS,
            max_reported_rejections: DEFAULT_MAX_REPORTED_REJECTIONS,
            max_flush_retries: DEFAULT_MAX_FLUSH_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            flush_timeout_secs: DEFAULT_FLUSH_TIMEOUT_SECS,
            read_ahead_rows: DEFAULT_READ_AHEAD_ROWS,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            continue_on_error: true,
        }
    }
}

/// Parsed value of `key` if set; a value that does not parse is an error
pub(crate) fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestError::config(format!("{key} has an invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(env_opt(key)?.unwrap_or(default))
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            batch_size: env_or("VEP_BATCH_SIZE", defaults.batch_size)?,
            unmapped_columns: env_or("VEP_UNMAPPED_COLUMNS", defaults.unmapped_columns)?,
            max_error_rate: env_or("VEP_MAX_ERROR_RATE", defaults.max_error_rate)?,
            error_rate_min_rows: env_or("VEP_ERROR_RATE_MIN_ROWS", defaults.error_rate_min_rows)?,
            max_reported_rejections: env_or(
                "VEP_MAX_REPORTED_REJECTIONS",
                defaults.max_reported_rejections,
            )?,
            max_flush_retries: env_or("VEP_MAX_FLUSH_RETRIES", defaults.max_flush_retries)?,
            retry_base_delay_ms: env_or("VEP_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: env_or("VEP_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            flush_timeout_secs: env_or("VEP_FLUSH_TIMEOUT_SECS", defaults.flush_timeout_secs)?,
            read_ahead_rows: env_or("VEP_READ_AHEAD_ROWS", defaults.read_ahead_rows)?,
            max_concurrent_files: env_or(
                "VEP_MAX_CONCURRENT_FILES",
                defaults.max_concurrent_files,
            )?,
            continue_on_error: env_or("VEP_CONTINUE_ON_ERROR", defaults.continue_on_error)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON run description; absent keys take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::config("batch_size must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(IngestError::config("max_error_rate must be between 0.0 and 1.0"));
        }
        if self.read_ahead_rows == 0 {
            return Err(IngestError::config("read_ahead_rows must be greater than 0"));
        }
        if self.max_concurrent_files == 0 {
            return Err(IngestError::config("max_concurrent_files must be greater than 0"));
        }
        if self.flush_timeout_secs == 0 {
            return Err(IngestError::config("flush_timeout_secs must be greater than 0"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(IngestError::config(
                "retry_base_delay_ms must not exceed retry_max_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    /// Backoff before retry number `attempt` (0-based): base * 2^attempt, capped
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = [
        "VEP_BATCH_SIZE",
        "VEP_UNMAPPED_COLUMNS",
        "VEP_MAX_ERROR_RATE",
        "VEP_CONTINUE_ON_ERROR",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.batch_size, 5000);
        assert_eq!(config.max_reported_rejections, 10);
        assert_eq!(config.unmapped_columns, UnmappedColumnPolicy::Strict);
        assert!(config.continue_on_error);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        clear_env();
        std::env::set_var("VEP_BATCH_SIZE", "250");
        std::env::set_var("VEP_UNMAPPED_COLUMNS", "lenient");
        std::env::set_var("VEP_CONTINUE_ON_ERROR", "false");

        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.unmapped_columns, UnmappedColumnPolicy::Lenient);
        assert!(!config.continue_on_error);
        assert_eq!(config.max_error_rate, DEFAULT_MAX_ERROR_RATE);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_from_env_rejects_garbage() {
        clear_env();
        std::env::set_var("VEP_MAX_ERROR_RATE", "lots");
        assert!(matches!(IngestConfig::from_env(), Err(IngestError::Config(_))));

        std::env::set_var("VEP_MAX_ERROR_RATE", "1.5");
        assert!(matches!(IngestConfig::from_env(), Err(IngestError::Config(_))));

        clear_env();
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config =
            IngestConfig::from_json_str(r#"{"batch_size": 100, "unmapped_columns": "lenient"}"#)
                .unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.unmapped_columns, UnmappedColumnPolicy::Lenient);
        assert_eq!(config.max_flush_retries, DEFAULT_MAX_FLUSH_RETRIES);

        assert!(IngestConfig::from_json_str(r#"{"batch_size": 0}"#).is_err());
    }

    #[test]
    fn test_retry_delay_backoff() {
        let config = IngestConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(800));
        assert_eq!(config.retry_delay(4), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(60), Duration::from_millis(1000));
    }
}
