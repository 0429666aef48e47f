//! Process configuration.
//!
//! Everything is read from environment variables (after `dotenvy` has been
//! given a chance to populate them); unset or unparsable values fall back to
//! defaults with a warning rather than failing startup.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

/// Default per-entry failure threshold percent.
const DEFAULT_EXPORT_FAIL_PCT: f64 = 50.0;

/// Default retry budget before acking entries whose parent job is missing.
const DEFAULT_MAX_JOB_NOT_FOUND_RETRIES: i64 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Root for in-progress artifacts.
    pub staging_dir: PathBuf,
    /// Root for completed artifacts.
    pub payload_dir: PathBuf,
    /// Per-entry failure threshold percent, clamped to [0, 100].
    pub export_fail_pct: f64,
    /// Budget before acking orphan entries.
    pub max_job_not_found_retries: i64,
    /// Non-empty enables queue-depth gauge publishing.
    pub deployment_target: String,
    /// Number of queue consumers.
    pub worker_pool_size: usize,
    /// Dequeue poll fallback interval.
    pub worker_poll_interval_ms: u64,
    /// Cadence of the per-entry cancellation monitor.
    pub cancellation_poll_secs: u64,
    /// Upstream FHIR origin, e.g. "https://fhir.example.gov".
    pub upstream_host: String,
    /// Base path used for MBI lookups (per-job resource calls carry their own).
    pub upstream_base_path: String,
    pub upstream_timeout_secs: u64,
    pub log_dir: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "sqlite:claims-export.db?mode=rwc"),
            staging_dir: PathBuf::from(env_or("STAGING_DIR", "data/staging")),
            payload_dir: PathBuf::from(env_or("PAYLOAD_DIR", "data/payload")),
            export_fail_pct: clamp_fail_pct(env_parse_or(
                "EXPORT_FAIL_PCT",
                DEFAULT_EXPORT_FAIL_PCT,
            )),
            max_job_not_found_retries: env_parse_or(
                "MAX_JOB_NOT_FOUND_RETRIES",
                DEFAULT_MAX_JOB_NOT_FOUND_RETRIES,
            ),
            deployment_target: std::env::var("DEPLOYMENT_TARGET").unwrap_or_default(),
            worker_pool_size: env_parse_or("WORKER_POOL_SIZE", 3usize).max(1),
            worker_poll_interval_ms: env_parse_or("WORKER_POLL_INTERVAL_MS", 100u64).max(1),
            cancellation_poll_secs: env_parse_or("CANCELLATION_POLL_SECS", 15u64).max(1),
            upstream_host: std::env::var("UPSTREAM_HOST").unwrap_or_default(),
            upstream_base_path: env_or("UPSTREAM_BASE_PATH", "/v2/fhir"),
            upstream_timeout_secs: env_parse_or("UPSTREAM_TIMEOUT_SECS", 30u64),
            log_dir: env_or("LOG_DIR", "logs"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw = %raw, default = %default, "Unparsable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn clamp_fail_pct(pct: f64) -> f64 {
    if pct.is_nan() {
        DEFAULT_EXPORT_FAIL_PCT
    } else {
        pct.clamp(0.0, 100.0)
    }
}
