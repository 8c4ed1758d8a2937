use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use ::redis::aio::ConnectionManager;

use super::connection::RedisConnection;
use crate::jobs::{DeadLetterEntry, DeadLetterEnvelope, DeadLetterQueue, DeadLetterRetention};
use crate::store::StoreError;

const ENVELOPE_FIELD: &str = "envelope";

/// Dead-letter queue on a Redis stream, capped by length and age.
pub struct RedisDeadLetterQueue {
    name: String,
    stream_key: String,
    connection: Arc<RedisConnection>,
    retention: DeadLetterRetention,
    closed: AtomicBool,
}

impl RedisDeadLetterQueue {
    pub fn new(name: impl Into<String>, connection: Arc<RedisConnection>) -> Self {
        let name = name.into();
        Self {
            stream_key: format!("queue:{name}:stream"),
            name,
            connection,
            retention: DeadLetterRetention::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_retention(mut self, retention: DeadLetterRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.connection.manager().await
    }
}

fn entry_from_fields(
    id: String,
    fields: &HashMap<String, String>,
) -> Result<DeadLetterEntry, StoreError> {
    let raw = fields.get(ENVELOPE_FIELD).ok_or_else(|| {
        StoreError::Serialization(format!("dead-letter entry {id} has no envelope"))
    })?;
    let envelope =
        serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(DeadLetterEntry { id, envelope })
}

#[async_trait]
impl DeadLetterQueue for RedisDeadLetterQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, envelope: DeadLetterEnvelope) -> Result<String, StoreError> {
        let body = serde_json::to_string(&envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;

        let id: String = ::redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.retention.max_len)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await?;

        let max_age = i64::try_from(self.retention.max_age.as_millis()).unwrap_or(i64::MAX);
        let min_id = Utc::now().timestamp_millis().saturating_sub(max_age).max(0);
        // Age trimming is best-effort; the entry is already written.
        if let Err(err) = ::redis::cmd("XTRIM")
            .arg(&self.stream_key)
            .arg("MINID")
            .arg("~")
            .arg(min_id)
            .query_async::<_, i64>(&mut conn)
            .await
        {
            tracing::warn!(stream = %self.stream_key, error = %err, "dead-letter trim failed");
        }

        Ok(id)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, HashMap<String, String>)> = ::redis::cmd("XREVRANGE")
            .arg(&self.stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        rows.into_iter()
            .map(|(id, fields)| entry_from_fields(id, &fields))
            .collect()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ErrorInfo, Job, JobId, JobOptions};
    use retention_core::SweepPayload;

    #[test]
    fn stream_entry_decodes_envelope() {
        let job = Job::new(
            JobId::new("retention-nightly"),
            "retention-sweep",
            SweepPayload::default(),
            JobOptions::default(),
        );
        let envelope = DeadLetterEnvelope::for_job(
            "retention",
            &job,
            ErrorInfo::new("RetentionSweepError", "statement timeout"),
        );
        let fields = HashMap::from([(
            ENVELOPE_FIELD.to_string(),
            serde_json::to_string(&envelope).unwrap(),
        )]);

        let entry = entry_from_fields("1700000000000-0".into(), &fields).unwrap();
        assert_eq!(entry.id, "1700000000000-0");
        assert_eq!(entry.envelope, envelope);
    }

    #[test]
    fn stream_entry_without_envelope_is_rejected() {
        let err = entry_from_fields("1-0".into(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn stream_key_uses_queue_name() {
        let conn = Arc::new(RedisConnection::open("redis://127.0.0.1:6379").unwrap());
        let dlq = RedisDeadLetterQueue::new("retention-dlq", conn);
        assert_eq!(dlq.stream_key(), "queue:retention-dlq:stream");
    }
}
