//! Sweep processor: runs the retention service under the distributed lock.
//!
//! One execution attempt owns one fresh lock token. While the retention service runs, a
//! heartbeat task extends the lock every `ttl / 3`. A failed extension does not abort
//! the sweep (each deletion batch is safe on its own) but the attempt is reported as
//! [`SweepError::LockLost`] once the service returns.
//!
//! A panic inside the retention service is caught and reported as
//! [`SweepError::Retention`]; the lock is released either way.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use retention_core::{SweepOutcome, SweepPayload, SweepReport, Trigger};

use crate::jobs::{ErrorInfo, Job, JobId};
use crate::lock::{DistributedLock, LockToken};

const MIN_HEARTBEAT: Duration = Duration::from_millis(250);
const MAX_HEARTBEAT: Duration = Duration::from_secs(60);

/// Options passed to the retention service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepOptions {
    pub dry_run: bool,
}

/// The component that actually deletes expired rows.
///
/// Calls must be safe to repeat with overlapping cutoff windows.
#[async_trait]
pub trait RetentionService: Send + Sync {
    async fn run_sweep(&self, options: SweepOptions) -> anyhow::Result<SweepReport>;
}

/// The lock is held by another execution.
///
/// A control-flow signal for the worker runtime, not an application failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("retention lock {lock_key} is held elsewhere; job {job_id} not run")]
pub struct LockHeldError {
    pub job_id: JobId,
    pub lock_key: String,
    pub trigger: Trigger,
    pub idempotency_key: Option<String>,
}

/// Sweep processor error.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    LockHeld(#[from] LockHeldError),

    #[error(
        "retention lock {lock_key} was lost while job {job_id} was running \
         ({total_deleted_rows} rows deleted); the run cannot be trusted"
    )]
    LockLost {
        job_id: JobId,
        lock_key: String,
        total_deleted_rows: u64,
    },

    #[error("retention sweep failed: {0:#}")]
    Retention(anyhow::Error),
}

impl SweepError {
    /// Error name recorded in dead-letter envelopes.
    pub fn name(&self) -> &'static str {
        match self {
            SweepError::LockHeld(_) => "LockHeldError",
            SweepError::LockLost { .. } => "LockLostError",
            SweepError::Retention(_) => "RetentionSweepError",
        }
    }

    pub fn is_lock_held(&self) -> bool {
        matches!(self, SweepError::LockHeld(_))
    }

    pub fn error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.name(), self.to_string());
        match self {
            // anyhow's debug rendering lists the cause chain.
            SweepError::Retention(err) => info.with_stack(format!("{err:?}")),
            _ => info,
        }
    }
}

/// Where and how long the sweep lock is held.
#[derive(Clone)]
pub struct LockSettings {
    pub lock: DistributedLock,
    pub key: String,
    pub ttl: Duration,
}

/// Runs one sweep job.
#[derive(Clone)]
pub struct SweepProcessor {
    retention: Arc<dyn RetentionService>,
    lock: Option<LockSettings>,
}

impl SweepProcessor {
    /// Single-instance processor: no lock.
    pub fn new(retention: Arc<dyn RetentionService>) -> Self {
        Self {
            retention,
            lock: None,
        }
    }

    pub fn with_lock(
        mut self,
        lock: DistributedLock,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        self.lock = Some(LockSettings {
            lock,
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn lock_key(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.key.as_str())
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, attempts_made = job.attempts_made),
        err
    )]
    pub async fn process(&self, job: &Job) -> Result<SweepOutcome, SweepError> {
        let payload = job.payload.clone().normalized();
        let options = SweepOptions {
            dry_run: payload.dry_run,
        };

        let Some(lock) = &self.lock else {
            let report = self.run_retention(options).await?;
            return Ok(outcome(report, payload));
        };

        let token = LockToken::generate();
        if !lock.lock.acquire(&lock.key, &token, lock.ttl).await {
            debug!(lock_key = %lock.key, "retention lock busy");
            return Err(LockHeldError {
                job_id: job.id.clone(),
                lock_key: lock.key.clone(),
                trigger: payload.trigger,
                idempotency_key: payload.idempotency_key.clone(),
            }
            .into());
        }

        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        // Stops the heartbeat even if this future is dropped mid-sweep.
        let _stop_guard = stop.clone().drop_guard();
        let heartbeat = tokio::spawn(heartbeat(
            lock.clone(),
            token.clone(),
            lost.clone(),
            stop.clone(),
        ));

        let result = self.run_retention(options).await;

        stop.cancel();
        if let Err(err) = heartbeat.await {
            error!(lock_key = %lock.key, error = %err, "lock heartbeat task failed");
            lost.store(true, Ordering::SeqCst);
        }

        if !lock.lock.release(&lock.key, &token).await {
            warn!(
                lock_key = %lock.key,
                "retention lock was not released (expired or taken over)"
            );
        }

        let report = result?;

        if lost.load(Ordering::SeqCst) {
            return Err(SweepError::LockLost {
                job_id: job.id.clone(),
                lock_key: lock.key.clone(),
                total_deleted_rows: report.total_deleted_rows,
            });
        }

        info!(
            total_deleted_rows = report.total_deleted_rows,
            dry_run = report.dry_run,
            "retention sweep completed"
        );
        Ok(outcome(report, payload))
    }

    async fn run_retention(&self, options: SweepOptions) -> Result<SweepReport, SweepError> {
        match AssertUnwindSafe(self.retention.run_sweep(options))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(SweepError::Retention),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "retention sweep panicked");
                Err(SweepError::Retention(anyhow::anyhow!(
                    "retention sweep panicked: {message}"
                )))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Heartbeat period for a lock TTL: a third of the TTL, within [250ms, 60s].
pub fn heartbeat_interval(ttl: Duration) -> Duration {
    (ttl / 3).clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
}

async fn heartbeat(
    lock: LockSettings,
    token: LockToken,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let period = heartbeat_interval(lock.ttl);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                // An extend already in flight finishes before the stop is observed.
                if !lock.lock.extend(&lock.key, &token, lock.ttl).await
                    && !lost.swap(true, Ordering::SeqCst)
                {
                    warn!(
                        lock_key = %lock.key,
                        "retention lock extension failed; the sweep continues but fails afterwards"
                    );
                }
            }
        }
    }
}

fn outcome(report: SweepReport, payload: SweepPayload) -> SweepOutcome {
    SweepOutcome {
        report,
        trigger: payload.trigger,
        requested_by: payload.requested_by,
        idempotency_key: payload.idempotency_key,
    }
}
