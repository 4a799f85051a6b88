//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub log_level: Level,
    /// `production` hides internal error details from response bodies.
    pub app_env: String,
    pub lock_ttl: Duration,
    pub generation_concurrency: usize,
    pub generation_max_batch: u32,
    pub job_poll_interval: Duration,
    /// An active job without a heartbeat for this long is handed back to the queue.
    pub job_stall_timeout: Duration,
    pub cors_origin: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Server, Database and Cache ---
        let bind_address = parsed("BIND_ADDRESS", "0.0.0.0:3000")?;
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;
        let database_max_connections = parsed("DATABASE_MAX_CONNECTIONS", "10")?;
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;
        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        // --- Redemption and Generation ---
        let lock_ttl = Duration::from_secs(parsed("LOCK_TTL_SECONDS", "180")?);
        let generation_concurrency: usize = parsed("CODE_GENERATION_CONCURRENCY", "3")?;
        if generation_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "CODE_GENERATION_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let generation_max_batch = parsed("CODE_GENERATION_MAX_BATCH", "5000")?;
        let job_poll_interval = Duration::from_millis(parsed("JOB_POLL_INTERVAL_MS", "500")?);
        let job_stall_timeout = stall_timeout(parsed("JOB_STALL_TIMEOUT_SECS", "60")?)?;

        let cors_origin =
            std::env::var("CORS_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            bind_address,
            database_url,
            database_max_connections,
            redis_url,
            log_level,
            app_env,
            lock_ttl,
            generation_concurrency,
            generation_max_batch,
            job_poll_interval,
            job_stall_timeout,
            cors_origin,
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

fn stall_timeout(secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidValue(
            "JOB_STALL_TIMEOUT_SECS".to_string(),
            "must be at least 1".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

/// Reads `name` (or `default` when unset) and parses it.
fn parsed<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_falls_back_to_the_default() {
        let value: u32 = parsed("COUPON_BOOK_TEST_UNSET_VARIABLE", "42").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parsed_reports_the_variable_name() {
        let err = parsed::<u32>("COUPON_BOOK_TEST_UNSET_VARIABLE", "many").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "COUPON_BOOK_TEST_UNSET_VARIABLE"));
    }

    #[test]
    fn stall_timeout_must_be_positive() {
        assert_eq!(stall_timeout(60).unwrap(), Duration::from_secs(60));
        assert!(matches!(
            stall_timeout(0).unwrap_err(),
            ConfigError::InvalidValue(name, _) if name == "JOB_STALL_TIMEOUT_SECS"
        ));
    }
}
