//! Configuration (SPEC_FULL.md §4.11). Loaded from the process environment;
//! `.env` is picked up in development via `dotenvy`, the same shape the
//! wider ecosystem's Postgres-backed worker binaries use.

use crate::error::{BatchflowError, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub worker_poll_batch_size: usize,
    pub worker_poll_interval: Duration,
    pub worker_max_in_flight: usize,
    pub worker_lease_seconds: i64,

    pub retry_max_attempts: i32,
    pub retry_base_delay_ms: i64,
    pub retry_max_delay_ms: i64,

    pub file_reuse_enabled: bool,
    pub file_reuse_days: i64,

    pub finalizer_interval: Duration,

    pub submission_max_units_per_job: usize,

    pub storage_base_path: String,
    pub storage_bucket: String,

    pub timezone: chrono_tz::Tz,

    pub database_url: String,
}

impl Config {
    /// Loads a `.env` file if present (ignored if absent, production
    /// deployments set real environment variables) and then parses every
    /// key from the environment. Invalid configuration is a systemic
    /// failure: the caller should abort startup rather than run pollers
    /// against a broken config (spec.md §7).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            worker_poll_batch_size: env_parse("WORKER_POLL_BATCH_SIZE", 100)?,
            worker_poll_interval: Duration::from_millis(env_parse("WORKER_POLL_INTERVAL_MS", 500)?),
            worker_max_in_flight: env_parse("WORKER_MAX_IN_FLIGHT", 8)?,
            worker_lease_seconds: env_parse("WORKER_LEASE_SECONDS", 300)?,

            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 5)?,
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", 500)?,
            retry_max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", 60_000)?,

            file_reuse_enabled: env_parse("FILE_REUSE_ENABLED", true)?,
            file_reuse_days: env_parse("FILE_REUSE_DAYS", 7)?,

            finalizer_interval: Duration::from_millis(env_parse("FINALIZER_INTERVAL_MS", 5_000)?),

            submission_max_units_per_job: env_parse("SUBMISSION_MAX_UNITS_PER_JOB", 5_000)?,

            storage_base_path: env_string("STORAGE_BASE_PATH", "exports")?,
            storage_bucket: env_string("STORAGE_BUCKET", "")?,

            timezone: env_timezone("TIMEZONE", chrono_tz::UTC)?,

            database_url: env_string("DATABASE_URL", "")?,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| BatchflowError::Config(format!("{key}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(BatchflowError::Config(format!("{key}: {e}"))),
    }
}

fn env_string(key: &str, default: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(raw) => Ok(raw),
        Err(std::env::VarError::NotPresent) => Ok(default.to_string()),
        Err(e) => Err(BatchflowError::Config(format!("{key}: {e}"))),
    }
}

fn env_timezone(key: &str, default: chrono_tz::Tz) -> Result<chrono_tz::Tz> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BatchflowError::Config(format!("{key}: not a valid IANA timezone"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(BatchflowError::Config(format!("{key}: {e}"))),
    }
}
