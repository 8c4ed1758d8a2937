//! `retention-core`: domain building blocks for the retention sweep.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the sweep
//! payload, idempotency-key normalization, and the report a sweep produces.

pub mod error;
pub mod idempotency;
pub mod payload;
pub mod report;

pub use error::{DomainError, DomainResult};
pub use idempotency::{IdempotencyKey, JOB_ID_PREFIX, resolve_idempotency_key};
pub use payload::{SweepPayload, SweepRequest, Trigger};
pub use report::{RuleReport, SweepOutcome, SweepReport};
