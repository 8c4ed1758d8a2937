//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retention_core::SweepPayload;

/// Job identifier: derived from an idempotency key, or assigned by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

/// Backoff between native retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub strategy: BackoffStrategy,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total executions allowed, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff {
                strategy: BackoffStrategy::Fixed,
                delay,
            },
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff {
                strategy: BackoffStrategy::Exponential,
                delay: base_delay,
            },
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.backoff.strategy {
            BackoffStrategy::Fixed => self.backoff.delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.backoff.delay.saturating_mul(factor)
            }
        }
    }

    /// No executions left after `attempts_made` failures.
    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts.max(1)
    }
}

/// How long finished jobs stay visible in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepPolicy {
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    pub max_count: usize,
}

impl KeepPolicy {
    pub fn new(max_age: Duration, max_count: usize) -> Self {
        Self { max_age, max_count }
    }
}

/// Options attached to a job at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Explicit id; `None` lets the queue assign one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub retry: RetryPolicy,
    pub keep_completed: KeepPolicy,
    pub keep_failed: KeepPolicy,
}

/// Completed jobs: 1 day / 1000 entries.
pub const DEFAULT_KEEP_COMPLETED: KeepPolicy = KeepPolicy {
    max_age: Duration::from_secs(24 * 60 * 60),
    max_count: 1000,
};

/// Failed jobs: 7 days / 5000 entries.
pub const DEFAULT_KEEP_FAILED: KeepPolicy = KeepPolicy {
    max_age: Duration::from_secs(7 * 24 * 60 * 60),
    max_count: 5000,
};

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            retry: RetryPolicy::default(),
            keep_completed: DEFAULT_KEEP_COMPLETED,
            keep_failed: DEFAULT_KEEP_FAILED,
        }
    }
}

impl JobOptions {
    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready, waiting for a consumer
    Waiting,
    /// Waiting for its native retry backoff to elapse
    Delayed,
    /// Reserved by exactly one consumer
    Active,
    Completed,
    /// Attempts exhausted; kept for inspection and manual retry
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A queued retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: SweepPayload,
    pub options: JobOptions,
    /// Failed executions so far (incremented by the queue).
    pub attempts_made: u32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// When the current (or last) execution started.
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a delayed job may run again.
    pub ready_at: Option<DateTime<Utc>>,
    /// While active: the consumer must renew before this or the job counts as stalled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    /// Times the job was recovered from a consumer that stopped renewing its lease.
    #[serde(default)]
    pub stalled_count: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
}

impl Job {
    /// Create a waiting job.
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        payload: SweepPayload,
        options: JobOptions,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
            options,
            attempts_made: 0,
            state: JobState::Waiting,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            ready_at: None,
            lease_until: None,
            stalled_count: 0,
            failed_reason: None,
            return_value: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.options.retry.max_attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.options.retry.is_exhausted(self.attempts_made)
    }

    /// An active job whose lease ran out.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_until.is_some_and(|until| until < now)
    }

    /// Check if the job can be reserved now.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.ready_at.is_none_or(|at| now >= at),
            _ => false,
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn exhaustion_respects_max_attempts() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));

        // A zero-attempt policy still allows the first execution.
        assert!(!RetryPolicy::fixed(0, Duration::ZERO).is_exhausted(0));
        assert!(RetryPolicy::fixed(0, Duration::ZERO).is_exhausted(1));
    }

    #[test]
    fn default_options_match_documented_policy() {
        let options = JobOptions::default();

        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.backoff.strategy, BackoffStrategy::Exponential);
        assert_eq!(options.retry.backoff.delay, Duration::from_secs(5));
        assert_eq!(options.keep_completed, KeepPolicy::new(Duration::from_secs(86_400), 1000));
        assert_eq!(options.keep_failed, KeepPolicy::new(Duration::from_secs(604_800), 5000));
    }

    #[test]
    fn options_serialize_durations_as_millis() {
        let json = serde_json::to_value(JobOptions::default()).unwrap();

        assert_eq!(json["retry"]["backoff"]["type"], "exponential");
        assert_eq!(json["retry"]["backoff"]["delay"], 5000);
        assert_eq!(json["keepFailed"]["maxCount"], 5000);

        let back: JobOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, JobOptions::default());
    }

    #[test]
    fn delayed_job_becomes_ready() {
        let mut job = Job::new(
            JobId::new("retention-a"),
            "retention-sweep",
            SweepPayload::default(),
            JobOptions::default(),
        );
        let now = Utc::now();
        assert!(job.is_ready(now));

        job.state = JobState::Delayed;
        job.ready_at = Some(now + chrono::Duration::seconds(5));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(5)));

        job.state = JobState::Active;
        assert!(!job.is_ready(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn active_job_stalls_once_lease_expires() {
        let mut job = Job::new(
            JobId::new("retention-a"),
            "retention-sweep",
            SweepPayload::default(),
            JobOptions::default(),
        );
        let now = Utc::now();
        job.state = JobState::Active;
        assert!(!job.is_stalled(now), "no lease, nothing to expire");

        job.lease_until = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_stalled(now));
        assert!(job.is_stalled(now + chrono::Duration::seconds(31)));

        job.state = JobState::Completed;
        assert!(!job.is_stalled(now + chrono::Duration::seconds(31)));
    }
}
