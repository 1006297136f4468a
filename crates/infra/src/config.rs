//! Configuration loading from environment variables.

use std::time::Duration;

use reportd_core::WorkerId;

use crate::worker::WorkerSettings;

/// Service configuration shared by the API server and the worker.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// HTTP port for the API server.
    pub port: u16,
    /// Worker engine settings.
    pub worker: WorkerSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `PORT`: HTTP port (default: 3000)
    /// - `WORKER_POLL_INTERVAL_MS`: poll interval (default: 5000)
    /// - `WORKER_STALE_LOCK_TIMEOUT_MS`: lease expiry (default: 300000)
    /// - `WORKER_MAX_ATTEMPTS`: retry budget (default: 3)
    /// - `WORKER_INSTANCE_ID`: worker identity (default: generated)
    /// - `LOG_LEVEL`: consumed by the observability init (default: info)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let port: u16 = parse_var("PORT", 3000, "must be a valid port number")?;

        let poll_interval_ms: u64 = parse_var(
            "WORKER_POLL_INTERVAL_MS",
            5_000,
            "must be a duration in milliseconds",
        )?;
        let stale_lock_timeout_ms: u64 = parse_var(
            "WORKER_STALE_LOCK_TIMEOUT_MS",
            300_000,
            "must be a duration in milliseconds",
        )?;
        let max_attempts: u32 =
            parse_var("WORKER_MAX_ATTEMPTS", 3, "must be a positive integer")?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_MAX_ATTEMPTS",
                "must be a positive integer",
            ));
        }

        let instance_id = std::env::var("WORKER_INSTANCE_ID")
            .map(WorkerId::new)
            .unwrap_or_else(|_| WorkerId::generate());

        Ok(Self {
            database_url,
            port,
            worker: WorkerSettings {
                instance_id,
                poll_interval: Duration::from_millis(poll_interval_ms),
                stale_lock_timeout: Duration::from_millis(stale_lock_timeout_ms),
                max_attempts,
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    expectation: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, expectation)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
