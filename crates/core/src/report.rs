//! Results reported by a retention sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::Trigger;

/// Outcome of one retention rule (one table) within a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleReport {
    pub table: String,
    /// Rows older than this were eligible for deletion.
    pub cutoff: DateTime<Utc>,
    pub batch_size: u32,
    /// Rows deleted, or rows that would be deleted in a dry run.
    pub deleted_rows: u64,
}

/// What the retention service returns for one sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub executed_at: DateTime<Utc>,
    pub dry_run: bool,
    pub total_deleted_rows: u64,
    pub rules: Vec<RuleReport>,
}

impl SweepReport {
    /// Build a report, summing `total_deleted_rows` from the rules.
    pub fn new(executed_at: DateTime<Utc>, dry_run: bool, rules: Vec<RuleReport>) -> Self {
        let total_deleted_rows = rules.iter().map(|r| r.deleted_rows).sum();
        Self {
            executed_at,
            dry_run,
            total_deleted_rows,
            rules,
        }
    }
}

/// A sweep report tagged with the request that produced it.
///
/// This is the job's return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    #[serde(flatten)]
    pub report: SweepReport,
    pub trigger: Trigger,
    pub requested_by: String,
    pub idempotency_key: Option<String>,
}
