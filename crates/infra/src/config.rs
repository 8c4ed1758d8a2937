//! Worker configuration, read from the environment.
//!
//! Every numeric setting is clamped to a safe range. A value that does not parse is
//! logged and replaced by its default; configuration never fails startup.

use std::time::Duration;

pub const DEFAULT_QUEUE_NAME: &str = "retention-sweep";
pub const DEFAULT_LOCK_KEY: &str = "retention:sweep:lock";

const DEFAULT_LOCK_TTL_MS: u64 = 60_000;
const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_LOCK_HELD_REQUEUE_MAX: u32 = 3;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_JOB_LEASE_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Store URL. `None` runs single-instance: in-memory queue, no lock.
    pub redis_url: Option<String>,
    pub queue_name: String,
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub concurrency: usize,
    pub startup_timeout: Duration,
    pub lock_held_requeue_max: u32,
    /// Idle wait between reserve attempts when the queue is empty.
    pub poll_interval: Duration,
    /// How long a reserved job stays owned without a renewal before it counts as stalled.
    pub job_lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            concurrency: DEFAULT_CONCURRENCY,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            lock_held_requeue_max: DEFAULT_LOCK_HELD_REQUEUE_MAX,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            job_lease: Duration::from_millis(DEFAULT_JOB_LEASE_MS),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (the environment in production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |name: &str, default: u64| match text(name) {
            None => default,
            Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
                tracing::warn!(
                    variable = name,
                    value = %raw,
                    default,
                    "invalid number; using default"
                );
                default
            }),
        };

        Self {
            redis_url: text("REDIS_URL"),
            queue_name: text("RETENTION_QUEUE_NAME")
                .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            lock_key: text("RETENTION_LOCK_KEY").unwrap_or_else(|| DEFAULT_LOCK_KEY.to_string()),
            lock_ttl: clamp_lock_ttl(Duration::from_millis(number(
                "RETENTION_LOCK_TTL_MS",
                DEFAULT_LOCK_TTL_MS,
            ))),
            concurrency: clamp_concurrency(
                usize::try_from(number("RETENTION_WORKER_CONCURRENCY", DEFAULT_CONCURRENCY as u64))
                    .unwrap_or(usize::MAX),
            ),
            startup_timeout: clamp_startup_timeout(Duration::from_millis(number(
                "RETENTION_WORKER_STARTUP_TIMEOUT_MS",
                DEFAULT_STARTUP_TIMEOUT_MS,
            ))),
            lock_held_requeue_max: clamp_lock_held_requeue_max(
                u32::try_from(number(
                    "RETENTION_LOCK_HELD_REQUEUE_MAX",
                    u64::from(DEFAULT_LOCK_HELD_REQUEUE_MAX),
                ))
                .unwrap_or(u32::MAX),
            ),
            poll_interval: clamp_poll_interval(Duration::from_millis(number(
                "RETENTION_WORKER_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            ))),
            job_lease: clamp_job_lease(Duration::from_millis(number(
                "RETENTION_JOB_LEASE_MS",
                DEFAULT_JOB_LEASE_MS,
            ))),
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = clamp_lock_ttl(ttl);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = clamp_concurrency(concurrency);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = clamp_startup_timeout(timeout);
        self
    }

    pub fn with_lock_held_requeue_max(mut self, max: u32) -> Self {
        self.lock_held_requeue_max = clamp_lock_held_requeue_max(max);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = clamp_poll_interval(interval);
        self
    }

    pub fn with_job_lease(mut self, lease: Duration) -> Self {
        self.job_lease = clamp_job_lease(lease);
        self
    }

    /// Name of the dead-letter queue paired with the job queue.
    pub fn dead_letter_queue_name(&self) -> String {
        format!("{}-dlq", self.queue_name)
    }
}

pub fn clamp_lock_ttl(ttl: Duration) -> Duration {
    ttl.clamp(Duration::from_secs(1), Duration::from_secs(3600))
}

pub fn clamp_concurrency(concurrency: usize) -> usize {
    concurrency.clamp(1, 64)
}

pub fn clamp_startup_timeout(timeout: Duration) -> Duration {
    timeout.clamp(Duration::from_secs(1), Duration::from_secs(120))
}

pub fn clamp_lock_held_requeue_max(max: u32) -> u32 {
    max.min(1000)
}

pub fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.clamp(Duration::from_millis(10), Duration::from_secs(10))
}

pub fn clamp_job_lease(lease: Duration) -> Duration {
    lease.clamp(Duration::from_millis(100), Duration::from_secs(3600))
}
