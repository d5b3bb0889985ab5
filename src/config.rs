//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Sizing for one worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of concurrent execution slots.
    pub max_workers: usize,
    /// Capacity of the inbound queue.
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        Self {
            max_workers,
            queue_capacity,
        }
    }
}

/// Task engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pool serving `normal` (and unrecognised) priorities.
    pub default_pool: PoolConfig,
    /// Pool serving `high` priority.
    pub high_priority_pool: PoolConfig,
    /// Pool serving `low` priority.
    pub background_pool: PoolConfig,
    /// How often due scheduled tasks are scanned.
    pub scheduler_interval: Duration,
    /// How often a running task's status row is polled for cancellation.
    pub cancel_poll_interval: Duration,
    /// How often stale queued rows are re-offered to the pools.
    pub reconcile_interval: Duration,
    /// Age after which an undispatched queued row counts as stale.
    pub stale_queued_after: Duration,
    /// How long shutdown waits for in-flight tasks after cancelling them.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_pool: PoolConfig::new(3, 100),
            high_priority_pool: PoolConfig::new(2, 100),
            background_pool: PoolConfig::new(1, 100),
            scheduler_interval: Duration::from_secs(30),
            cancel_poll_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(60),
            stale_queued_after: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Build from `MARQUEE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            default_pool: PoolConfig::new(
                env_parse("MARQUEE_DEFAULT_WORKERS", d.default_pool.max_workers)?,
                env_parse("MARQUEE_DEFAULT_QUEUE", d.default_pool.queue_capacity)?,
            ),
            high_priority_pool: PoolConfig::new(
                env_parse("MARQUEE_HIGH_WORKERS", d.high_priority_pool.max_workers)?,
                env_parse("MARQUEE_HIGH_QUEUE", d.high_priority_pool.queue_capacity)?,
            ),
            background_pool: PoolConfig::new(
                env_parse("MARQUEE_BACKGROUND_WORKERS", d.background_pool.max_workers)?,
                env_parse("MARQUEE_BACKGROUND_QUEUE", d.background_pool.queue_capacity)?,
            ),
            scheduler_interval: env_secs("MARQUEE_SCHEDULER_INTERVAL_SECS", d.scheduler_interval)?,
            cancel_poll_interval: env_secs("MARQUEE_CANCEL_POLL_SECS", d.cancel_poll_interval)?,
            reconcile_interval: env_secs("MARQUEE_RECONCILE_INTERVAL_SECS", d.reconcile_interval)?,
            stale_queued_after: env_secs("MARQUEE_STALE_QUEUED_SECS", d.stale_queued_after)?,
            shutdown_grace: env_secs("MARQUEE_SHUTDOWN_GRACE_SECS", d.shutdown_grace)?,
        }
        .validated()?)
    }

    /// Reject sizes that would leave a pool unable to run anything, and
    /// loop periods of zero.
    pub fn validated(self) -> Result<Self, ConfigError> {
        for (key, pool) in [
            ("default", self.default_pool),
            ("high-priority", self.high_priority_pool),
            ("background", self.background_pool),
        ] {
            if pool.max_workers == 0 || pool.queue_capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{key} pool"),
                    message: "workers and queue capacity must be at least 1".to_string(),
                });
            }
        }
        for (key, period) in [
            ("scheduler_interval", self.scheduler_interval),
            ("cancel_poll_interval", self.cancel_poll_interval),
            ("reconcile_interval", self.reconcile_interval),
        ] {
            if period.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(self)
    }
}

/// Process-level configuration for the server binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/marquee.db"),
            log_dir: None,
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("MARQUEE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| AppConfig::default().db_path);
        let log_dir = std::env::var("MARQUEE_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            db_path,
            log_dir,
            engine: EngineConfig::from_env()?,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
