//! Infrastructure layer for the retention sweep: job queue, distributed lock,
//! dead-letter queue, sweep processor, and the worker runtime that ties them together.
//!
//! In-memory implementations of every store are always available (single-instance mode
//! and tests). Redis implementations live behind the `redis` feature.

pub mod config;
pub mod jobs;
pub mod lock;
pub mod store;
pub mod sweep;
pub mod worker;

#[cfg(feature = "redis")]
pub mod redis;

pub use config::WorkerConfig;
pub use jobs::{
    DeadLetterEnvelope, DeadLetterQueue, ErrorInfo, Job, JobId, JobOptions, JobQueue,
    SweepEnqueuer,
};
pub use lock::{DistributedLock, LockStore, LockToken};
pub use store::{StoreConnection, StoreError};
pub use sweep::{RetentionService, SweepError, SweepOptions, SweepProcessor};
pub use worker::{QueueBackend, RuntimeError, RuntimeState, WorkerRuntime, WorkerStats};
