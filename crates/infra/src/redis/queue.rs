use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::redis::Script;
use ::redis::aio::ConnectionManager;

use retention_core::SweepPayload;

use super::connection::RedisConnection;
use crate::jobs::{
    Enqueued, Job, JobCounts, JobId, JobOptions, JobQueue, JobState, KeepPolicy,
    MAX_STALLED_COUNT, QueueError, STALLED_REASON, StalledJobs,
};
use crate::store::{StoreConnection, StoreError};

/// Job queue stored in Redis. Every state transition is a single Lua script, so a job is
/// reserved by at most one worker across processes.
///
/// `:active` is a zset scored by lease expiry; [`JobQueue::recover_stalled`] hands jobs whose
/// consumer stopped renewing back to `:wait`.
pub struct RedisJobQueue {
    name: String,
    prefix: String,
    connection: Arc<RedisConnection>,
    closed: AtomicBool,
    add_script: Script,
    reserve_script: Script,
    complete_script: Script,
    fail_script: Script,
    retry_script: Script,
    trim_script: Script,
    extend_lease_script: Script,
    stalled_script: Script,
}

impl RedisJobQueue {
    pub fn new(name: impl Into<String>, connection: Arc<RedisConnection>) -> Self {
        let name = name.into();
        Self {
            prefix: format!("queue:{name}"),
            name,
            connection,
            closed: AtomicBool::new(false),
            add_script: Script::new(include_str!("lua/add.lua")),
            reserve_script: Script::new(include_str!("lua/reserve.lua")),
            complete_script: Script::new(include_str!("lua/complete.lua")),
            fail_script: Script::new(include_str!("lua/fail.lua")),
            retry_script: Script::new(include_str!("lua/retry.lua")),
            trim_script: Script::new(include_str!("lua/trim.lua")),
            extend_lease_script: Script::new(include_str!("lua/extend_lease.lua")),
            stalled_script: Script::new(include_str!("lua/stalled.lua")),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.connection.manager().await
    }

    async fn trim(
        &self,
        conn: &mut ConnectionManager,
        finished_key: &str,
        keep: KeepPolicy,
        now: i64,
    ) -> Result<(), StoreError> {
        let max_age = i64::try_from(keep.max_age.as_millis()).unwrap_or(i64::MAX);
        let _: i64 = self
            .trim_script
            .key(finished_key)
            .arg(now.saturating_sub(max_age))
            .arg(keep.max_count)
            .arg(self.job_key_prefix())
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn lease_until_ms(now: i64, lease: Duration) -> i64 {
    now.saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_ms(fields: &HashMap<String, String>, key: &str) -> Option<DateTime<Utc>> {
    fields
        .get(key)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

/// Rebuild a job from its hash fields.
fn job_from_hash(fields: HashMap<String, String>) -> Result<Job, StoreError> {
    let field = |key: &str| {
        fields
            .get(key)
            .ok_or_else(|| StoreError::Serialization(format!("job hash missing field `{key}`")))
    };
    let json_err = |e: serde_json::Error| StoreError::Serialization(e.to_string());

    let payload: SweepPayload = serde_json::from_str(field("payload")?).map_err(json_err)?;
    let options: JobOptions = serde_json::from_str(field("opts")?).map_err(json_err)?;
    let state_raw = field("state")?;
    let state = JobState::parse(state_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown job state `{state_raw}`")))?;
    let return_value: Option<serde_json::Value> = fields
        .get("return_value")
        .map(|raw| serde_json::from_str(raw))
        .transpose()
        .map_err(json_err)?;

    Ok(Job {
        id: JobId::new(field("id")?.as_str()),
        name: field("name")?.clone(),
        payload,
        options,
        attempts_made: fields
            .get("attempts_made")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        state,
        created_at: parse_ms(&fields, "created_at").unwrap_or_else(Utc::now),
        processed_at: parse_ms(&fields, "processed_at"),
        finished_at: parse_ms(&fields, "finished_at"),
        ready_at: parse_ms(&fields, "ready_at"),
        lease_until: parse_ms(&fields, "lease_until"),
        stalled_count: fields
            .get("stalled_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        failed_reason: fields.get("failed_reason").cloned(),
        return_value,
    })
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.connection.ping().await
    }

    async fn add(
        &self,
        name: &str,
        payload: SweepPayload,
        options: JobOptions,
    ) -> Result<Enqueued, QueueError> {
        let mut conn = self.conn().await?;

        let job_id = match &options.job_id {
            Some(id) => id.clone(),
            None => {
                let next: u64 = ::redis::cmd("INCR")
                    .arg(self.key("id"))
                    .query_async(&mut conn)
                    .await
                    .map_err(StoreError::from)?;
                JobId::new(next.to_string())
            }
        };

        let created: i64 = self
            .add_script
            .key(self.job_key(&job_id))
            .key(self.key("wait"))
            .arg(job_id.as_str())
            .arg(name)
            .arg(to_json(&payload)?)
            .arg(to_json(&options)?)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        Ok(Enqueued {
            job_id,
            created: created == 1,
        })
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(job_from_hash(fields)?))
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let now = now_ms();
        let fields: Option<HashMap<String, String>> = self
            .reserve_script
            .key(self.key("wait"))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .arg(now)
            .arg(self.job_key_prefix())
            .arg(lease_until_ms(now, lease))
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        match fields {
            Some(fields) if !fields.is_empty() => Ok(Some(job_from_hash(fields)?)),
            _ => Ok(None),
        }
    }

    async fn extend_lease(&self, id: &JobId, lease: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let extended: i64 = self
            .extend_lease_script
            .key(self.job_key(id))
            .key(self.key("active"))
            .arg(id.as_str())
            .arg(lease_until_ms(now_ms(), lease))
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        Ok(extended == 1)
    }

    async fn recover_stalled(&self) -> Result<StalledJobs, QueueError> {
        let mut conn = self.conn().await?;
        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .stalled_script
            .key(self.key("active"))
            .key(self.key("wait"))
            .key(self.key("failed"))
            .arg(now_ms())
            .arg(self.job_key_prefix())
            .arg(MAX_STALLED_COUNT)
            .arg(STALLED_REASON)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        let mut stalled = StalledJobs {
            requeued: requeued.into_iter().map(JobId::from).collect(),
            failed: Vec::with_capacity(failed.len()),
        };
        for id in failed.into_iter().map(JobId::from) {
            if let Some(job) = self.get(&id).await? {
                stalled.failed.push(job);
            }
        }
        Ok(stalled)
    }

    async fn complete(
        &self,
        id: &JobId,
        return_value: serde_json::Value,
    ) -> Result<(), QueueError> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let mut conn = self.conn().await?;
        let now = now_ms();
        let completed_key = self.key("completed");

        let moved: i64 = self
            .complete_script
            .key(self.job_key(id))
            .key(self.key("active"))
            .key(&completed_key)
            .arg(id.as_str())
            .arg(now)
            .arg(to_json(&return_value)?)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        if moved == 0 {
            return Err(QueueError::NotActive(id.clone()));
        }

        self.trim(&mut conn, &completed_key, job.options.keep_completed, now)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: &JobId, reason: &str) -> Result<Job, QueueError> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let mut conn = self.conn().await?;
        let now = now_ms();
        let failed_key = self.key("failed");
        let retry = job.options.retry;

        let fields: Option<HashMap<String, String>> = self
            .fail_script
            .key(self.job_key(id))
            .key(self.key("active"))
            .key(self.key("delayed"))
            .key(&failed_key)
            .arg(id.as_str())
            .arg(now)
            .arg(reason)
            .arg(retry.max_attempts)
            .arg(retry.backoff.strategy.as_str())
            .arg(u64::try_from(retry.backoff.delay.as_millis()).unwrap_or(u64::MAX))
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        let updated = match fields {
            Some(fields) if !fields.is_empty() => job_from_hash(fields)?,
            _ => return Err(QueueError::NotActive(id.clone())),
        };

        if updated.state == JobState::Failed {
            self.trim(&mut conn, &failed_key, updated.options.keep_failed, now)
                .await?;
        }
        Ok(updated)
    }

    async fn retry(&self, id: &JobId) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let moved: i64 = self
            .retry_script
            .key(self.job_key(id))
            .key(self.key("failed"))
            .key(self.key("wait"))
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        match moved {
            1 => Ok(()),
            0 => Err(QueueError::NotRetryable(id.clone())),
            _ => Err(QueueError::NotFound(id.clone())),
        }
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.conn().await?;
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            ::redis::pipe()
                .cmd("LLEN")
                .arg(self.key("wait"))
                .cmd("ZCARD")
                .arg(self.key("delayed"))
                .cmd("ZCARD")
                .arg(self.key("active"))
                .cmd("ZCARD")
                .arg(self.key("completed"))
                .cmd("ZCARD")
                .arg(self.key("failed"))
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from)?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
