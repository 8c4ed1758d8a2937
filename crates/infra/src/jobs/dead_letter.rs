//! Dead-letter queue: an append-only record of jobs the runtime gave up on.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retention_core::SweepPayload;

use super::types::{Job, JobId};
use crate::store::{InMemoryConnection, StoreError};

/// Serialized description of the error that sent a job to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Build from any error; the source chain becomes the stack.
    pub fn from_error(name: impl Into<String>, err: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        let info = Self::new(name, err.to_string());
        if chain.is_empty() {
            info
        } else {
            info.with_stack(chain.join("\n"))
        }
    }
}

/// The record written for a dead-lettered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    pub failed_at: DateTime<Utc>,
    pub queue: String,
    pub job_id: JobId,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub payload: SweepPayload,
    pub error: ErrorInfo,
}

impl DeadLetterEnvelope {
    pub fn for_job(queue: impl Into<String>, job: &Job, error: ErrorInfo) -> Self {
        Self {
            failed_at: Utc::now(),
            queue: queue.into(),
            job_id: job.id.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts(),
            payload: job.payload.clone(),
            error,
        }
    }
}

/// A stored envelope and the id the queue gave it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub id: String,
    pub envelope: DeadLetterEnvelope,
}

/// How much dead-letter history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterRetention {
    pub max_age: Duration,
    pub max_len: usize,
}

impl Default for DeadLetterRetention {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(14 * 24 * 60 * 60),
            max_len: 10_000,
        }
    }
}

/// Dead-letter queue abstraction.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Append an envelope. Returns the entry id.
    async fn push(&self, envelope: DeadLetterEnvelope) -> Result<String, StoreError>;

    /// Newest entries first.
    async fn recent(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// In-memory dead-letter queue.
#[derive(Debug)]
pub struct InMemoryDeadLetterQueue {
    name: String,
    connection: Arc<InMemoryConnection>,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    retention: DeadLetterRetention,
    push_delay: Mutex<Duration>,
    seq: AtomicU64,
    closed: AtomicBool,
    fail_close: AtomicBool,
}

impl InMemoryDeadLetterQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_connection(name, Arc::new(InMemoryConnection::new()))
    }

    pub fn with_connection(name: impl Into<String>, connection: Arc<InMemoryConnection>) -> Self {
        Self {
            name: name.into(),
            connection,
            entries: Mutex::new(VecDeque::new()),
            retention: DeadLetterRetention::default(),
            push_delay: Mutex::new(Duration::ZERO),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        }
    }

    pub fn with_retention(mut self, retention: DeadLetterRetention) -> Self {
        self.retention = retention;
        self
    }

    /// Simulate a slow store: every push waits `delay` before writing.
    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock().unwrap() = delay;
    }

    /// Make `close()` report an error (after closing).
    pub fn fail_on_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Everything stored, oldest first.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, envelope: DeadLetterEnvelope) -> Result<String, StoreError> {
        let delay = *self.push_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_open()?;

        let now = Utc::now();
        // Stream-style ids: `<millis>-<sequence>`.
        let id = format!("{}-{}", now.timestamp_millis(), self.seq.fetch_add(1, Ordering::SeqCst));
        let mut entries = self.entries.lock().unwrap();

        entries.push_back(DeadLetterEntry {
            id: id.clone(),
            envelope,
        });

        let max_age =
            chrono::Duration::from_std(self.retention.max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        entries.retain(|entry| entry.envelope.failed_at >= cutoff);
        while entries.len() > self.retention.max_len {
            entries.pop_front();
        }

        Ok(id)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.ensure_open()?;
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(StoreError::Command("dead-letter close failed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobOptions;

    #[derive(Debug, thiserror::Error)]
    #[error("retention run failed")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("statement timeout")]
    struct Inner;

    fn job() -> Job {
        let mut job = Job::new(
            JobId::new("retention-cron-2026-02-21-run"),
            "retention-sweep",
            SweepPayload::default(),
            JobOptions::default(),
        );
        job.attempts_made = 3;
        job
    }

    #[test]
    fn error_info_keeps_source_chain() {
        let info = ErrorInfo::from_error("RetentionSweepError", &Outer(Inner));

        assert_eq!(info.name, "RetentionSweepError");
        assert_eq!(info.message, "retention run failed");
        assert_eq!(info.stack.as_deref(), Some("caused by: statement timeout"));
        assert!(ErrorInfo::from_error("X", &Inner).stack.is_none());
    }

    #[test]
    fn envelope_serializes_in_camel_case() {
        let envelope = DeadLetterEnvelope::for_job(
            "retention-sweep",
            &job(),
            ErrorInfo::new("LockHeldError", "lock held"),
        );
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["queue"], "retention-sweep");
        assert_eq!(json["jobId"], "retention-cron-2026-02-21-run");
        assert_eq!(json["attemptsMade"], 3);
        assert_eq!(json["maxAttempts"], 3);
        assert_eq!(json["error"]["name"], "LockHeldError");
        assert!(json["error"].get("stack").is_none());
        assert!(json.get("failedAt").is_some());
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let dlq = InMemoryDeadLetterQueue::new("retention-sweep-dlq");
        for reason in ["first", "second", "third"] {
            let envelope =
                DeadLetterEnvelope::for_job("retention-sweep", &job(), ErrorInfo::new("E", reason));
            dlq.push(envelope).await.unwrap();
        }

        let recent = dlq.recent(2).await.unwrap();
        let messages: Vec<_> = recent.iter().map(|e| e.envelope.error.message.as_str()).collect();
        assert_eq!(messages, vec!["third", "second"]);
    }

    #[tokio::test]
    async fn length_cap_drops_oldest() {
        let dlq =
            InMemoryDeadLetterQueue::new("retention-sweep-dlq").with_retention(DeadLetterRetention {
                max_age: Duration::from_secs(3600),
                max_len: 2,
            });
        for reason in ["a", "b", "c"] {
            let envelope =
                DeadLetterEnvelope::for_job("retention-sweep", &job(), ErrorInfo::new("E", reason));
            dlq.push(envelope).await.unwrap();
        }

        let kept: Vec<_> = dlq.entries().into_iter().map(|e| e.envelope.error.message).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn push_after_close_fails() {
        let dlq = InMemoryDeadLetterQueue::new("retention-sweep-dlq");
        dlq.close().await.unwrap();

        let envelope =
            DeadLetterEnvelope::for_job("retention-sweep", &job(), ErrorInfo::new("E", "m"));
        assert_eq!(dlq.push(envelope).await, Err(StoreError::Closed));
        assert!(dlq.is_empty());
    }
}
