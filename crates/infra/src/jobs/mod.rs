//! Retention sweep jobs: queue, dead-letter queue, and the enqueue facade.
//!
//! ## Components
//!
//! - `Job`: a queued sweep with its payload, retry policy, and attempt counter
//! - `JobQueue`: at-least-once delivery, idempotent by job id; reserved jobs carry a lease
//!   and are recovered when their consumer stops renewing it
//! - `DeadLetterQueue`: terminally failed jobs, kept for operator inspection
//! - `SweepEnqueuer`: derives the job identity from the idempotency key

pub mod dead_letter;
pub mod enqueue;
pub mod queue;
pub mod types;

pub use dead_letter::{
    DeadLetterEntry, DeadLetterEnvelope, DeadLetterQueue, DeadLetterRetention, ErrorInfo,
    InMemoryDeadLetterQueue,
};
pub use enqueue::{EnqueueError, EnqueuedSweep, SWEEP_JOB_NAME, SweepEnqueuer};
pub use queue::{
    Enqueued, InMemoryJobQueue, JobCounts, JobQueue, MAX_STALLED_COUNT, QueueError,
    STALLED_REASON, StalledJobs,
};
pub use types::{
    Backoff, BackoffStrategy, Job, JobId, JobOptions, JobState, KeepPolicy, RetryPolicy,
};
