//! Failure routing: native retry, lock-held auto-requeue, or dead-letter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerStats;
use crate::jobs::{
    DeadLetterEnvelope, DeadLetterQueue, ErrorInfo, Job, JobId, JobQueue, MAX_STALLED_COUNT,
    QueueError,
};
use crate::sweep::SweepError;

const MIN_REQUEUE_DELAY: Duration = Duration::from_millis(1);
const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(5 * 60);

pub const STALLED_ERROR_NAME: &str = "JobStalledError";

/// Terminal outcomes of the lock-held auto-requeue path.
#[derive(Debug, thiserror::Error)]
pub enum RequeueError {
    #[error("lock-held requeue budget exhausted for job {job_id} ({count} > {max})")]
    Exhausted { job_id: JobId, count: u32, max: u32 },

    #[error("lock-held requeue of job {job_id} aborted by shutdown")]
    Aborted { job_id: JobId },

    #[error("queue cannot requeue job {job_id}")]
    Unavailable { job_id: JobId },

    #[error("requeue of job {job_id} failed")]
    Failed {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

impl RequeueError {
    pub fn name(&self) -> &'static str {
        match self {
            RequeueError::Exhausted { .. } => "RequeueExhaustedError",
            RequeueError::Aborted { .. } => "RequeueAbortedError",
            RequeueError::Unavailable { .. } => "RequeueUnavailableError",
            RequeueError::Failed { .. } => "RequeueFailedError",
        }
    }

    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::from_error(self.name(), self)
    }
}

/// What the router did with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Left to the queue's own retry schedule.
    NativeRetry,
    /// Moved back to waiting after a lock-held exhaustion.
    Requeued,
    /// Written to the dead-letter queue with this error name.
    DeadLettered(String),
    /// The dead-letter write itself failed (logged).
    DeadLetterFailed(String),
}

/// Requeues needed so far for a job failing with the lock held elsewhere.
///
/// `max(attempts - max_attempts + 1, attempts, 1)`.
pub fn lock_held_requeue_count(attempts_made: u32, max_attempts: u32) -> u32 {
    attempts_made
        .saturating_add(1)
        .saturating_sub(max_attempts)
        .max(attempts_made)
        .max(1)
}

/// Wait before a lock-held requeue: the job's base backoff delay, within [1ms, 5min].
pub fn resolve_requeue_delay(job: &Job) -> Duration {
    job.options
        .retry
        .backoff
        .delay
        .clamp(MIN_REQUEUE_DELAY, MAX_REQUEUE_DELAY)
}

/// Routes a failed job once the queue has recorded the failure.
#[derive(Clone)]
pub struct FailureRouter {
    queue: Arc<dyn JobQueue>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    shutdown: CancellationToken,
    requeue_max: u32,
    stats: Arc<Mutex<WorkerStats>>,
}

impl FailureRouter {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        dead_letter: Arc<dyn DeadLetterQueue>,
        shutdown: CancellationToken,
        requeue_max: u32,
        stats: Arc<Mutex<WorkerStats>>,
    ) -> Self {
        Self {
            queue,
            dead_letter,
            shutdown,
            requeue_max,
            stats,
        }
    }

    /// `job` is the job as updated by the queue's `fail` (attempt counter included).
    pub async fn route(&self, job: Job, err: &SweepError) -> FailureDisposition {
        if err.is_lock_held() {
            return self.route_lock_held(job).await;
        }

        if job.attempts_exhausted() {
            return self.dead_letter(&job, err.error_info()).await;
        }

        debug!(
            job_id = %job.id,
            attempts_made = job.attempts_made,
            max_attempts = job.max_attempts(),
            "job failed; queue will retry"
        );
        FailureDisposition::NativeRetry
    }

    async fn route_lock_held(&self, job: Job) -> FailureDisposition {
        if !job.attempts_exhausted() {
            debug!(
                job_id = %job.id,
                attempts_made = job.attempts_made,
                "lock held elsewhere; queue will redeliver"
            );
            return FailureDisposition::NativeRetry;
        }

        let count = lock_held_requeue_count(job.attempts_made, job.max_attempts());
        if count > self.requeue_max {
            let err = RequeueError::Exhausted {
                job_id: job.id.clone(),
                count,
                max: self.requeue_max,
            };
            return self.dead_letter(&job, err.error_info()).await;
        }

        if !self.queue.supports_retry() {
            let err = RequeueError::Unavailable {
                job_id: job.id.clone(),
            };
            return self.dead_letter(&job, err.error_info()).await;
        }

        let delay = resolve_requeue_delay(&job);
        debug!(
            job_id = %job.id,
            count,
            delay_ms = delay.as_millis() as u64,
            "lock-held requeue scheduled"
        );

        let aborted = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        if aborted || self.shutdown.is_cancelled() {
            let err = RequeueError::Aborted {
                job_id: job.id.clone(),
            };
            return self.dead_letter(&job, err.error_info()).await;
        }

        match self.queue.retry(&job.id).await {
            Ok(()) => {
                self.stats.lock().unwrap().requeued += 1;
                info!(job_id = %job.id, count, max = self.requeue_max, "lock-held job requeued");
                FailureDisposition::Requeued
            }
            Err(source) => {
                let err = RequeueError::Failed {
                    job_id: job.id.clone(),
                    source,
                };
                self.dead_letter(&job, err.error_info()).await
            }
        }
    }

    /// A job the queue failed because its worker kept losing the lease.
    pub async fn route_stalled(&self, job: Job) -> FailureDisposition {
        let error = ErrorInfo::new(
            STALLED_ERROR_NAME,
            format!(
                "job {} stalled {} times (limit {MAX_STALLED_COUNT})",
                job.id, job.stalled_count
            ),
        );
        self.dead_letter(&job, error).await
    }

    async fn dead_letter(&self, job: &Job, error: ErrorInfo) -> FailureDisposition {
        let name = error.name.clone();
        let envelope = DeadLetterEnvelope::for_job(self.queue.name(), job, error);

        match self.dead_letter.push(envelope).await {
            Ok(entry_id) => {
                self.stats.lock().unwrap().dead_lettered += 1;
                warn!(
                    job_id = %job.id,
                    entry_id = %entry_id,
                    error_name = %name,
                    attempts_made = job.attempts_made,
                    "job dead-lettered"
                );
                FailureDisposition::DeadLettered(name)
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    error_name = %name,
                    error = %err,
                    "failed to dead-letter job"
                );
                FailureDisposition::DeadLetterFailed(name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        InMemoryDeadLetterQueue, InMemoryJobQueue, JobOptions, JobState, RetryPolicy,
        STALLED_REASON,
    };
    use crate::store::StoreError;
    use crate::sweep::LockHeldError;
    use retention_core::{SweepPayload, Trigger};

    struct Harness {
        queue: Arc<InMemoryJobQueue>,
        dlq: Arc<InMemoryDeadLetterQueue>,
        shutdown: CancellationToken,
        stats: Arc<Mutex<WorkerStats>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                queue: InMemoryJobQueue::arc("retention-sweep"),
                dlq: Arc::new(InMemoryDeadLetterQueue::new("retention-sweep-dlq")),
                shutdown: CancellationToken::new(),
                stats: Arc::new(Mutex::new(WorkerStats::default())),
            }
        }

        fn router(&self, requeue_max: u32) -> FailureRouter {
            FailureRouter::new(
                self.queue.clone(),
                self.dlq.clone(),
                self.shutdown.clone(),
                requeue_max,
                self.stats.clone(),
            )
        }

        /// A job stored in the queue as failed after `attempts` of `max` executions.
        fn failed_job(&self, attempts: u32, max: u32) -> Job {
            let options = JobOptions::default()
                .with_retry(RetryPolicy::exponential(max, Duration::from_secs(5)));
            let mut job = Job::new(
                JobId::new("retention-cron-2026-02-21-run"),
                "retention-sweep",
                SweepPayload::default(),
                options,
            );
            job.attempts_made = attempts;
            job.state = if job.attempts_exhausted() {
                JobState::Failed
            } else {
                JobState::Delayed
            };
            self.queue.insert(job.clone());
            job
        }

        fn dead_lettered_names(&self) -> Vec<String> {
            self.dlq
                .entries()
                .into_iter()
                .map(|e| e.envelope.error.name)
                .collect()
        }
    }

    fn lock_held(job: &Job) -> SweepError {
        LockHeldError {
            job_id: job.id.clone(),
            lock_key: "retention:sweep:lock".to_string(),
            trigger: Trigger::Cron,
            idempotency_key: Some("cron-2026-02-21-run".to_string()),
        }
        .into()
    }

    #[test]
    fn requeue_count_formula() {
        assert_eq!(lock_held_requeue_count(3, 3), 3);
        assert_eq!(lock_held_requeue_count(0, 3), 1);
        assert_eq!(lock_held_requeue_count(5, 0), 6);
        assert_eq!(lock_held_requeue_count(1, 1), 1);
        assert_eq!(lock_held_requeue_count(u32::MAX, 0), u32::MAX);
    }

    #[test]
    fn requeue_delay_is_clamped() {
        let h = Harness::new();
        let mut job = h.failed_job(3, 3);
        assert_eq!(resolve_requeue_delay(&job), Duration::from_secs(5));

        job.options.retry = RetryPolicy::fixed(3, Duration::ZERO);
        assert_eq!(resolve_requeue_delay(&job), Duration::from_millis(1));

        job.options.retry = RetryPolicy::fixed(3, Duration::from_secs(3600));
        assert_eq!(resolve_requeue_delay(&job), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn exhausted_lock_held_with_zero_budget_dead_letters_without_retry() {
        let h = Harness::new();
        let job = h.failed_job(3, 3);
        let err = lock_held(&job);

        let disposition = h.router(0).route(job, &err).await;

        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered("RequeueExhaustedError".to_string())
        );
        assert_eq!(h.queue.retry_calls(), 0);
        assert_eq!(h.dead_lettered_names(), vec!["RequeueExhaustedError"]);

        let entry = &h.dlq.entries()[0];
        assert_eq!(entry.envelope.attempts_made, 3);
        assert_eq!(entry.envelope.max_attempts, 3);
        assert_eq!(entry.envelope.queue, "retention-sweep");
        assert_eq!(h.stats.lock().unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn lock_held_with_attempts_left_is_not_dead_lettered() {
        let h = Harness::new();
        let job = h.failed_job(1, 3);
        let err = lock_held(&job);

        let disposition = h.router(0).route(job, &err).await;

        assert_eq!(disposition, FailureDisposition::NativeRetry);
        assert!(h.dlq.is_empty());
        assert_eq!(h.queue.retry_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_lock_held_within_budget_is_requeued() {
        let h = Harness::new();
        let job = h.failed_job(3, 3);
        let err = lock_held(&job);

        let disposition = h.router(3).route(job.clone(), &err).await;

        assert_eq!(disposition, FailureDisposition::Requeued);
        assert_eq!(h.queue.retry_calls(), 1);
        assert!(h.dlq.is_empty());

        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(h.stats.lock().unwrap().requeued, 1);
    }

    #[tokio::test]
    async fn queue_without_retry_dead_letters_unavailable() {
        let h = Harness::new();
        h.queue.set_retry_supported(false);
        let job = h.failed_job(3, 3);
        let err = lock_held(&job);

        let disposition = h.router(3).route(job, &err).await;

        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered("RequeueUnavailableError".to_string())
        );
        assert_eq!(h.queue.retry_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_retry_dead_letters_requeue_failed() {
        let h = Harness::new();
        h.queue
            .fail_retries_with(StoreError::Connection("connection reset".to_string()));
        let job = h.failed_job(3, 3);
        let err = lock_held(&job);

        let disposition = h.router(3).route(job, &err).await;

        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered("RequeueFailedError".to_string())
        );
        let entry = &h.dlq.entries()[0];
        let stack = entry.envelope.error.stack.clone().unwrap();
        assert!(stack.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_pending_requeue() {
        let h = Harness::new();
        let job = h.failed_job(3, 3);
        let err = lock_held(&job);
        let router = h.router(3);

        let pending = tokio::spawn(async move { router.route(job, &err).await });
        tokio::task::yield_now().await;
        h.shutdown.cancel();

        let disposition = pending.await.unwrap();
        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered("RequeueAbortedError".to_string())
        );
        assert_eq!(h.queue.retry_calls(), 0);
    }

    #[tokio::test]
    async fn exhausted_ordinary_failure_is_dead_lettered_with_original_error() {
        let h = Harness::new();
        let job = h.failed_job(3, 3);
        let err = SweepError::Retention(anyhow::anyhow!("deadlock detected"));

        let disposition = h.router(3).route(job, &err).await;

        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered("RetentionSweepError".to_string())
        );
        let entry = &h.dlq.entries()[0];
        assert!(entry.envelope.error.message.contains("deadlock detected"));
        assert_eq!(h.queue.retry_calls(), 0);
    }

    #[tokio::test]
    async fn ordinary_failure_with_attempts_left_uses_native_retry() {
        let h = Harness::new();
        let job = h.failed_job(1, 3);
        let err = SweepError::Retention(anyhow::anyhow!("deadlock detected"));

        assert_eq!(h.router(3).route(job, &err).await, FailureDisposition::NativeRetry);
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn dead_letter_write_failure_is_reported() {
        let h = Harness::new();
        h.dlq.close().await.unwrap();
        let job = h.failed_job(3, 3);
        let err = lock_held(&job);

        let disposition = h.router(0).route(job, &err).await;

        assert_eq!(
            disposition,
            FailureDisposition::DeadLetterFailed("RequeueExhaustedError".to_string())
        );
    }

    #[tokio::test]
    async fn stalled_job_is_dead_lettered_with_stall_count() {
        let h = Harness::new();
        let mut job = h.failed_job(0, 3);
        job.state = JobState::Failed;
        job.stalled_count = 2;
        job.failed_reason = Some(STALLED_REASON.to_string());

        let disposition = h.router(3).route_stalled(job).await;

        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered(STALLED_ERROR_NAME.to_string())
        );
        let entry = &h.dlq.entries()[0];
        assert!(entry.envelope.error.message.contains("stalled 2 times"));
        assert_eq!(entry.envelope.attempts_made, 0);
        assert_eq!(h.stats.lock().unwrap().dead_lettered, 1);
        assert_eq!(h.queue.retry_calls(), 0);
    }
}
