//! Orchestrator configuration loaded from environment variables.
//!
//! Every knob has a production default; `Config::from_env()` only requires
//! `DATABASE_URL`. Durations are given in whole seconds
//! (`CONDUCTOR_POLLING_INTERVAL_SECS` etc.) to keep the environment surface
//! boring.

use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Terminal-metadata sweep settings. Cleanup only runs when configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataCleanup {
    /// How often the manager attempts a sweep.
    pub cleanup_interval: Duration,
    /// Terminal records older than this are deleted.
    pub retention_period: Duration,
    /// Rows deleted per transaction.
    pub batch_size: i64,
}

impl Default for MetadataCleanup {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60 * 60),
            retention_period: Duration::from_secs(60 * 60 * 24 * 14),
            batch_size: 1_000,
        }
    }
}

/// Application configuration for the manager and dispatcher loops.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    /// Manager cycle period.
    pub polling_interval: Duration,
    /// Dispatcher claim period.
    pub job_dispatcher_polling_interval: Duration,
    /// Upper bound on enqueues per manager cycle.
    pub max_jobs_per_cycle: i64,
    /// Global dispatcher pool size.
    pub max_active_jobs: usize,

    /// Retries before dead-letter, when the manifest does not override.
    pub default_max_retries: i32,
    /// Base backoff delay.
    pub default_retry_delay: Duration,
    /// Backoff base.
    pub retry_backoff_multiplier: f64,
    /// Backoff cap.
    pub max_retry_delay: Duration,

    /// Fallback timeout for manifests without one.
    pub default_job_timeout: Duration,
    /// Run the reaper once before the first manager cycle.
    pub recover_stuck_jobs_on_startup: bool,
    /// The reaper also runs on every N-th manager cycle.
    pub reaper_cycle_stride: u64,

    /// Resolved dead letters older than this are purged.
    pub dead_letter_retention_period: Duration,
    /// Whether resolved dead letters are purged at all.
    pub auto_purge_dead_letters: bool,

    /// Terminal-metadata sweep; `None` disables cleanup entirely.
    pub metadata_cleanup: Option<MetadataCleanup>,

    /// Independently disable the loops.
    pub manifest_manager_enabled: bool,
    pub job_dispatcher_enabled: bool,

    /// Host identity stamped onto execution records.
    pub executor_name: String,

    /// How long `stop` waits for in-flight work before force-cancelling.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            polling_interval: Duration::from_secs(5),
            job_dispatcher_polling_interval: Duration::from_secs(5),
            max_jobs_per_cycle: 100,
            max_active_jobs: 10,
            default_max_retries: 3,
            default_retry_delay: Duration::from_secs(5 * 60),
            retry_backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(60 * 60),
            default_job_timeout: Duration::from_secs(20 * 60),
            recover_stuck_jobs_on_startup: true,
            reaper_cycle_stride: 6,
            dead_letter_retention_period: Duration::from_secs(60 * 60 * 24 * 30),
            auto_purge_dead_letters: true,
            metadata_cleanup: None,
            manifest_manager_enabled: true,
            job_dispatcher_enabled: true,
            executor_name: default_executor_name(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Config::default();

        let metadata_cleanup = match env_secs("CONDUCTOR_CLEANUP_INTERVAL_SECS")? {
            Some(cleanup_interval) => Some(MetadataCleanup {
                cleanup_interval,
                retention_period: env_secs("CONDUCTOR_METADATA_RETENTION_SECS")?
                    .unwrap_or(MetadataCleanup::default().retention_period),
                batch_size: env_i64("CONDUCTOR_CLEANUP_BATCH_SIZE")?
                    .unwrap_or(MetadataCleanup::default().batch_size),
            }),
            None => None,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            polling_interval: env_secs("CONDUCTOR_POLLING_INTERVAL_SECS")?
                .unwrap_or(defaults.polling_interval),
            job_dispatcher_polling_interval: env_secs("CONDUCTOR_DISPATCHER_POLLING_INTERVAL_SECS")?
                .unwrap_or(defaults.job_dispatcher_polling_interval),
            max_jobs_per_cycle: env_i64("CONDUCTOR_MAX_JOBS_PER_CYCLE")?
                .unwrap_or(defaults.max_jobs_per_cycle),
            max_active_jobs: env_usize("CONDUCTOR_MAX_ACTIVE_JOBS")?
                .unwrap_or(defaults.max_active_jobs),
            default_max_retries: env_i32("CONDUCTOR_DEFAULT_MAX_RETRIES")?
                .unwrap_or(defaults.default_max_retries),
            default_retry_delay: env_secs("CONDUCTOR_DEFAULT_RETRY_DELAY_SECS")?
                .unwrap_or(defaults.default_retry_delay),
            retry_backoff_multiplier: env_f64("CONDUCTOR_RETRY_BACKOFF_MULTIPLIER")?
                .unwrap_or(defaults.retry_backoff_multiplier),
            max_retry_delay: env_secs("CONDUCTOR_MAX_RETRY_DELAY_SECS")?
                .unwrap_or(defaults.max_retry_delay),
            default_job_timeout: env_secs("CONDUCTOR_DEFAULT_JOB_TIMEOUT_SECS")?
                .unwrap_or(defaults.default_job_timeout),
            recover_stuck_jobs_on_startup: env_bool("CONDUCTOR_RECOVER_STUCK_JOBS_ON_STARTUP")?
                .unwrap_or(defaults.recover_stuck_jobs_on_startup),
            reaper_cycle_stride: env_u64("CONDUCTOR_REAPER_CYCLE_STRIDE")?
                .unwrap_or(defaults.reaper_cycle_stride)
                .max(1),
            dead_letter_retention_period: env_secs("CONDUCTOR_DEAD_LETTER_RETENTION_SECS")?
                .unwrap_or(defaults.dead_letter_retention_period),
            auto_purge_dead_letters: env_bool("CONDUCTOR_AUTO_PURGE_DEAD_LETTERS")?
                .unwrap_or(defaults.auto_purge_dead_letters),
            metadata_cleanup,
            manifest_manager_enabled: env_bool("CONDUCTOR_MANIFEST_MANAGER_ENABLED")?
                .unwrap_or(defaults.manifest_manager_enabled),
            job_dispatcher_enabled: env_bool("CONDUCTOR_JOB_DISPATCHER_ENABLED")?
                .unwrap_or(defaults.job_dispatcher_enabled),
            executor_name: env::var("CONDUCTOR_EXECUTOR_NAME").unwrap_or(defaults.executor_name),
            drain_timeout: env_secs("CONDUCTOR_DRAIN_TIMEOUT_SECS")?
                .unwrap_or(defaults.drain_timeout),
        })
    }

    /// Backoff knobs bundled for the retry engine.
    pub fn retry_defaults(&self) -> crate::retry::RetryDefaults {
        crate::retry::RetryDefaults {
            max_retries: self.default_max_retries,
            retry_delay: chrono::Duration::from_std(self.default_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            backoff_multiplier: self.retry_backoff_multiplier,
            max_retry_delay: chrono::Duration::from_std(self.max_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
        }
    }
}

fn default_executor_name() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "conductor".to_string());
    format!("{host}-{}", std::process::id())
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    Ok(env_u64(key)?.map(Duration::from_secs))
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    parse_env(key)
}

fn env_i64(key: &str) -> Result<Option<i64>> {
    parse_env(key)
}

fn env_i32(key: &str) -> Result<Option<i32>> {
    parse_env(key)
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    parse_env(key)
}

fn env_f64(key: &str) -> Result<Option<f64>> {
    parse_env(key)
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => anyhow::bail!("{key} must be a boolean, got {other:?}"),
        },
        Err(_) => Ok(None),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} must parse, got {raw:?}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.polling_interval, Duration::from_secs(5));
        assert_eq!(config.job_dispatcher_polling_interval, Duration::from_secs(5));
        assert_eq!(config.max_jobs_per_cycle, 100);
        assert_eq!(config.max_active_jobs, 10);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.default_retry_delay, Duration::from_secs(300));
        assert_eq!(config.retry_backoff_multiplier, 2.0);
        assert_eq!(config.max_retry_delay, Duration::from_secs(3600));
        assert_eq!(config.default_job_timeout, Duration::from_secs(1200));
        assert!(config.recover_stuck_jobs_on_startup);
        assert_eq!(
            config.dead_letter_retention_period,
            Duration::from_secs(60 * 60 * 24 * 30)
        );
        assert!(config.auto_purge_dead_letters);
        assert!(config.metadata_cleanup.is_none());
        assert!(config.manifest_manager_enabled);
        assert!(config.job_dispatcher_enabled);
    }

    #[test]
    fn retry_defaults_convert_durations() {
        let defaults = Config::default().retry_defaults();
        assert_eq!(defaults.retry_delay, chrono::Duration::minutes(5));
        assert_eq!(defaults.max_retry_delay, chrono::Duration::hours(1));
        assert_eq!(defaults.max_retries, 3);
    }

    #[test]
    fn cleanup_defaults() {
        let cleanup = MetadataCleanup::default();
        assert_eq!(cleanup.batch_size, 1_000);
        assert_eq!(cleanup.cleanup_interval, Duration::from_secs(3600));
    }
}
