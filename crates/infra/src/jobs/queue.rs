//! Job queue abstraction and its in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use retention_core::SweepPayload;

use super::types::{Job, JobId, JobOptions, JobState, KeepPolicy};
use crate::store::{InMemoryConnection, StoreConnection, StoreError};

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is not active")]
    NotActive(JobId),
    #[error("job {0} is not in the failed state")]
    NotRetryable(JobId),
}

/// Result of adding a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: JobId,
    /// `false` when a job with the same id already existed (the add was merged).
    pub created: bool,
}

/// Recoveries after which a stalled job is failed instead of requeued.
pub const MAX_STALLED_COUNT: u32 = 1;

/// Reason recorded on a job failed by stall recovery.
pub const STALLED_REASON: &str = "job stalled more than the allowed limit";

/// Outcome of one stalled-job check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StalledJobs {
    /// Moved back to waiting.
    pub requeued: Vec<JobId>,
    /// Stalled more than [`MAX_STALLED_COUNT`] times; now failed.
    pub failed: Vec<Job>,
}

impl StalledJobs {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Job queue abstraction.
///
/// Delivery is at-least-once, and a job is reserved by at most one consumer at a time.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name (used in dead-letter envelopes and logs).
    fn name(&self) -> &str;

    /// Round-trip to the backing store.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Add a job. A job whose id already exists is not duplicated.
    async fn add(
        &self,
        name: &str,
        payload: SweepPayload,
        options: JobOptions,
    ) -> Result<Enqueued, QueueError>;

    /// Get a job by ID.
    async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError>;

    /// Claim the next ready job and mark it active, leased for `lease`.
    /// Returns None if no jobs are available.
    async fn reserve(&self, lease: Duration) -> Result<Option<Job>, QueueError>;

    /// Push the lease of an active job `lease` into the future.
    ///
    /// Returns `false` when the job is no longer active (completed, failed, or recovered
    /// as stalled).
    async fn extend_lease(&self, id: &JobId, lease: Duration) -> Result<bool, QueueError>;

    /// Recover active jobs whose lease expired: back to waiting, or failed once they
    /// stalled more than [`MAX_STALLED_COUNT`] times.
    async fn recover_stalled(&self) -> Result<StalledJobs, QueueError>;

    /// Mark an active job completed and apply its completed-retention policy.
    async fn complete(&self, id: &JobId, return_value: serde_json::Value)
    -> Result<(), QueueError>;

    /// Record a failed execution of an active job.
    ///
    /// Increments `attempts_made`; schedules the native retry with backoff, or moves the
    /// job to `failed` once attempts are exhausted. Returns the job after the update.
    async fn fail(&self, id: &JobId, reason: &str) -> Result<Job, QueueError>;

    /// Whether [`JobQueue::retry`] is available on this queue.
    fn supports_retry(&self) -> bool {
        true
    }

    /// Move a failed job back to waiting. The attempt counter is kept.
    async fn retry(&self, id: &JobId) -> Result<(), QueueError>;

    /// Get job statistics.
    async fn counts(&self) -> Result<JobCounts, QueueError>;

    /// Release the queue handle. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

fn lease_duration(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

/// In-memory job queue for single-instance mode and tests.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    connection: Arc<InMemoryConnection>,
    jobs: RwLock<HashMap<JobId, Job>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    retry_supported: AtomicBool,
    retry_error: RwLock<Option<StoreError>>,
    retry_calls: AtomicU32,
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_connection(name, Arc::new(InMemoryConnection::new()))
    }

    pub fn with_connection(name: impl Into<String>, connection: Arc<InMemoryConnection>) -> Self {
        Self {
            name: name.into(),
            connection,
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            retry_supported: AtomicBool::new(true),
            retry_error: RwLock::new(None),
            retry_calls: AtomicU32::new(0),
        }
    }

    pub fn arc(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// Disable (or re-enable) the manual retry capability.
    pub fn set_retry_supported(&self, supported: bool) {
        self.retry_supported.store(supported, Ordering::SeqCst);
    }

    /// Make every `retry` call fail with `err`.
    pub fn fail_retries_with(&self, err: StoreError) {
        *self.retry_error.write().unwrap() = Some(err);
    }

    /// Number of `retry` calls received.
    pub fn retry_calls(&self) -> u32 {
        self.retry_calls.load(Ordering::SeqCst)
    }

    /// Put a job in place as-is (tests and state restores).
    pub fn insert(&self, job: Job) {
        self.jobs.write().unwrap().insert(job.id.clone(), job);
    }

    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.connection.ensure_open()
    }

    fn trim_finished(
        jobs: &mut HashMap<JobId, Job>,
        state: JobState,
        keep: KeepPolicy,
        now: DateTime<Utc>,
    ) {
        let max_age = chrono::Duration::from_std(keep.max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        jobs.retain(|_, j| j.state != state || j.finished_at.is_none_or(|at| at >= cutoff));

        let mut finished: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.state == state)
            .map(|j| (j.finished_at.unwrap_or(j.created_at), j.id.clone()))
            .collect();

        if finished.len() > keep.max_count {
            finished.sort();
            let excess = finished.len() - keep.max_count;
            for (_, id) in finished.into_iter().take(excess) {
                jobs.remove(&id);
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.connection.ping().await
    }

    async fn add(
        &self,
        name: &str,
        payload: SweepPayload,
        options: JobOptions,
    ) -> Result<Enqueued, QueueError> {
        self.ensure_open()?;
        let mut jobs = self.jobs.write().unwrap();

        let job_id = match &options.job_id {
            Some(id) => id.clone(),
            None => JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string()),
        };

        if jobs.contains_key(&job_id) {
            return Ok(Enqueued {
                job_id,
                created: false,
            });
        }

        let job = Job::new(job_id.clone(), name, payload, options);
        jobs.insert(job_id.clone(), job);
        Ok(Enqueued {
            job_id,
            created: true,
        })
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.ensure_open()?;
        Ok(self.jobs.read().unwrap().get(id).cloned())
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<Job>, QueueError> {
        self.ensure_open()?;
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();

        // Oldest ready job first.
        let next = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.ready_at.unwrap_or(j.created_at), j.created_at))
            .map(|j| j.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        job.state = JobState::Active;
        job.processed_at = Some(now);
        job.ready_at = None;
        job.lease_until = Some(now + lease_duration(lease));
        Ok(Some(job.clone()))
    }

    async fn extend_lease(&self, id: &JobId, lease: Duration) -> Result<bool, QueueError> {
        self.ensure_open()?;
        let mut jobs = self.jobs.write().unwrap();

        match jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active => {
                job.lease_until = Some(Utc::now() + lease_duration(lease));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stalled(&self) -> Result<StalledJobs, QueueError> {
        self.ensure_open()?;
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();
        let mut stalled = StalledJobs::default();

        for job in jobs.values_mut().filter(|j| j.is_stalled(now)) {
            job.lease_until = None;
            job.stalled_count += 1;

            if job.stalled_count > MAX_STALLED_COUNT {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.failed_reason = Some(STALLED_REASON.to_string());
                stalled.failed.push(job.clone());
            } else {
                job.state = JobState::Waiting;
                stalled.requeued.push(job.id.clone());
            }
        }

        if let Some(keep) = stalled.failed.first().map(|j| j.options.keep_failed) {
            Self::trim_finished(&mut jobs, JobState::Failed, keep, now);
        }
        Ok(stalled)
    }

    async fn complete(
        &self,
        id: &JobId,
        return_value: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();

        let job = jobs.get_mut(id).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive(id.clone()));
        }
        job.state = JobState::Completed;
        job.finished_at = Some(now);
        job.lease_until = None;
        job.return_value = Some(return_value);
        let keep = job.options.keep_completed;

        Self::trim_finished(&mut jobs, JobState::Completed, keep, now);
        Ok(())
    }

    async fn fail(&self, id: &JobId, reason: &str) -> Result<Job, QueueError> {
        self.ensure_open()?;
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();

        let job = jobs.get_mut(id).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive(id.clone()));
        }

        job.attempts_made += 1;
        job.failed_reason = Some(reason.to_string());
        job.finished_at = Some(now);
        job.lease_until = None;

        if job.attempts_exhausted() {
            job.state = JobState::Failed;
        } else {
            let delay = job.options.retry.delay_for_attempt(job.attempts_made);
            job.state = JobState::Delayed;
            job.ready_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        }

        let updated = job.clone();
        if updated.state == JobState::Failed {
            Self::trim_finished(&mut jobs, JobState::Failed, updated.options.keep_failed, now);
        }
        Ok(updated)
    }

    fn supports_retry(&self) -> bool {
        self.retry_supported.load(Ordering::SeqCst)
    }

    async fn retry(&self, id: &JobId) -> Result<(), QueueError> {
        self.retry_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        if let Some(err) = self.retry_error.read().unwrap().clone() {
            return Err(err.into());
        }

        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(id).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if job.state != JobState::Failed {
            return Err(QueueError::NotRetryable(id.clone()));
        }
        job.state = JobState::Waiting;
        job.finished_at = None;
        job.ready_at = None;
        Ok(())
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        self.ensure_open()?;
        let jobs = self.jobs.read().unwrap();
        let mut counts = JobCounts::default();

        for job in jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }

        Ok(counts)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
