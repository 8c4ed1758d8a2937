use std::sync::Arc;

use async_trait::async_trait;

use super::connection::RedisConnection;
use super::dead_letter::RedisDeadLetterQueue;
use super::lock::RedisLockStore;
use super::queue::RedisJobQueue;
use crate::config::WorkerConfig;
use crate::jobs::{DeadLetterQueue, DeadLetterRetention, JobQueue};
use crate::lock::DistributedLock;
use crate::store::StoreError;
use crate::worker::QueueBackend;

/// Redis-backed worker resources. Each start opens a fresh connection.
#[derive(Debug, Clone)]
pub struct RedisBackend {
    url: String,
    queue_name: String,
    dead_letter_name: String,
    retention: DeadLetterRetention,
}

impl RedisBackend {
    /// Requires `redis_url`; the URL is validated here so misconfiguration fails fast.
    pub fn new(config: &WorkerConfig) -> Result<Self, StoreError> {
        let url = config
            .redis_url
            .clone()
            .ok_or_else(|| StoreError::Connection("REDIS_URL is not set".to_string()))?;
        RedisConnection::open(&url)?;

        Ok(Self {
            url,
            queue_name: config.queue_name.clone(),
            dead_letter_name: config.dead_letter_queue_name(),
            retention: DeadLetterRetention::default(),
        })
    }

    pub fn with_dead_letter_retention(mut self, retention: DeadLetterRetention) -> Self {
        self.retention = retention;
        self
    }

    /// A lock on its own connection, for the sweep processor.
    pub fn distributed_lock(&self) -> Result<DistributedLock, StoreError> {
        Ok(DistributedLock::new(Arc::new(RedisLockStore::open(&self.url)?)))
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<Arc<RedisConnection>, StoreError> {
        let connection = Arc::new(RedisConnection::open(&self.url)?);
        connection.manager().await?;
        Ok(connection)
    }

    async fn open_dead_letter(
        &self,
        connection: &Arc<RedisConnection>,
    ) -> Result<Arc<dyn DeadLetterQueue>, StoreError> {
        Ok(Arc::new(
            RedisDeadLetterQueue::new(self.dead_letter_name.clone(), connection.clone())
                .with_retention(self.retention),
        ))
    }

    async fn open_queue(
        &self,
        connection: &Arc<RedisConnection>,
    ) -> Result<Arc<dyn JobQueue>, StoreError> {
        Ok(Arc::new(RedisJobQueue::new(
            self.queue_name.clone(),
            connection.clone(),
        )))
    }
}
