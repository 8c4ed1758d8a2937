//! Sweep job payload: what a caller asks for, and the normalized form carried by a job.

use serde::{Deserialize, Serialize};

use crate::idempotency::IdempotencyKey;

/// Requester recorded when the caller does not identify itself.
pub const DEFAULT_REQUESTED_BY: &str = "system";

/// Upper bound (in characters) for `requested_by`.
pub const MAX_REQUESTED_BY_LEN: usize = 128;

/// What caused a sweep to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Operator or API initiated.
    #[default]
    Manual,
    /// Scheduler initiated.
    Cron,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Cron => "cron",
        }
    }
}

impl core::fmt::Display for Trigger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw enqueue request, as received from an entry point.
///
/// Every field is optional; [`SweepPayload`] is the normalized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepRequest {
    #[serde(default)]
    pub dry_run: Option<bool>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl SweepRequest {
    pub fn manual() -> Self {
        Self {
            trigger: Some(Trigger::Manual),
            ..Default::default()
        }
    }

    pub fn cron() -> Self {
        Self {
            trigger: Some(Trigger::Cron),
            requested_by: Some("cron".to_string()),
            ..Default::default()
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    pub fn requested_by(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = Some(requested_by.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Build the job payload. The idempotency key must already be resolved.
    pub fn into_payload(self, idempotency_key: Option<&IdempotencyKey>) -> SweepPayload {
        SweepPayload {
            dry_run: self.dry_run.unwrap_or(false),
            trigger: self.trigger.unwrap_or_default(),
            requested_by: normalize_requested_by(self.requested_by.as_deref()),
            idempotency_key: idempotency_key.map(|k| k.as_str().to_string()),
        }
    }
}

/// Normalized sweep payload carried by a queued job.
///
/// Missing fields deserialize to their defaults, so jobs written by other producers
/// still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SweepPayload {
    pub dry_run: bool,
    pub trigger: Trigger,
    pub requested_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Default for SweepPayload {
    fn default() -> Self {
        Self {
            dry_run: false,
            trigger: Trigger::Manual,
            requested_by: DEFAULT_REQUESTED_BY.to_string(),
            idempotency_key: None,
        }
    }
}

impl SweepPayload {
    /// Re-apply defaults to a payload that came off the queue.
    pub fn normalized(mut self) -> Self {
        self.requested_by = normalize_requested_by(Some(&self.requested_by));
        self.idempotency_key = self
            .idempotency_key
            .filter(|k| !k.trim().is_empty());
        self
    }
}

/// Trim, default to [`DEFAULT_REQUESTED_BY`], and cap at [`MAX_REQUESTED_BY_LEN`] characters.
pub fn normalize_requested_by(raw: Option<&str>) -> String {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return DEFAULT_REQUESTED_BY.to_string();
    }
    trimmed.chars().take(MAX_REQUESTED_BY_LEN).collect()
}
