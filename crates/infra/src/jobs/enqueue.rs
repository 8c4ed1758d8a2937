//! Enqueue facade: turns a sweep request into a queued job with a stable identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use retention_core::{DomainError, SweepPayload, SweepRequest, resolve_idempotency_key};

use super::queue::{JobQueue, QueueError};
use super::types::{JobId, JobOptions};

/// Job name used for retention sweeps.
pub const SWEEP_JOB_NAME: &str = "retention-sweep";

/// Enqueue error.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("invalid sweep request: {0}")]
    Invalid(#[from] DomainError),

    #[error("failed to enqueue sweep: {0}")]
    Queue(#[from] QueueError),
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedSweep {
    pub job_id: JobId,
    /// `false` when an equivalent sweep was already queued.
    pub created: bool,
    pub payload: SweepPayload,
}

/// Enqueues retention sweeps onto a [`JobQueue`].
#[derive(Clone)]
pub struct SweepEnqueuer {
    queue: Arc<dyn JobQueue>,
    defaults: JobOptions,
}

impl SweepEnqueuer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            defaults: JobOptions::default(),
        }
    }

    /// Replace the options applied when the caller passes none.
    pub fn with_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn enqueue(
        &self,
        request: SweepRequest,
        options: Option<JobOptions>,
    ) -> Result<EnqueuedSweep, EnqueueError> {
        self.enqueue_at(request, options, Utc::now()).await
    }

    /// Enqueue as of `now` (the UTC date picks the cron idempotency key).
    pub async fn enqueue_at(
        &self,
        request: SweepRequest,
        options: Option<JobOptions>,
        now: DateTime<Utc>,
    ) -> Result<EnqueuedSweep, EnqueueError> {
        let trigger = request.trigger.unwrap_or_default();
        let dry_run = request.dry_run.unwrap_or(false);

        let key =
            resolve_idempotency_key(request.idempotency_key.as_deref(), trigger, dry_run, now)?;
        let payload = request.into_payload(key.as_ref());

        let mut options = options.unwrap_or_else(|| self.defaults.clone());
        if let Some(key) = &key {
            // The key-derived id always wins: that is what makes enqueue idempotent.
            options.job_id = Some(JobId::new(key.job_id()));
        }

        let enqueued = self.queue.add(SWEEP_JOB_NAME, payload.clone(), options).await?;

        if enqueued.created {
            info!(
                job_id = %enqueued.job_id,
                trigger = %payload.trigger,
                dry_run = payload.dry_run,
                requested_by = %payload.requested_by,
                "retention sweep enqueued"
            );
        } else {
            debug!(job_id = %enqueued.job_id, "retention sweep already queued");
        }

        Ok(EnqueuedSweep {
            job_id: enqueued.job_id,
            created: enqueued.created,
            payload,
        })
    }
}
