//! Store backends the worker runtime opens its resources from.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::jobs::{DeadLetterQueue, InMemoryDeadLetterQueue, InMemoryJobQueue, JobQueue};
use crate::store::{InMemoryConnection, StoreConnection, StoreError};

/// Opens the connection, dead-letter queue, and job queue for one worker start.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    type Connection: StoreConnection + 'static;

    async fn connect(&self) -> Result<Arc<Self::Connection>, StoreError>;

    async fn open_dead_letter(
        &self,
        connection: &Arc<Self::Connection>,
    ) -> Result<Arc<dyn DeadLetterQueue>, StoreError>;

    async fn open_queue(
        &self,
        connection: &Arc<Self::Connection>,
    ) -> Result<Arc<dyn JobQueue>, StoreError>;
}

/// In-process backend: single-instance mode and tests.
///
/// Clones share the same queue, dead-letter queue, and connection, so a caller can keep
/// a handle for enqueueing and inspection while the runtime owns another.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    connection: Arc<InMemoryConnection>,
    queue: Arc<InMemoryJobQueue>,
    dead_letter: Arc<InMemoryDeadLetterQueue>,
    connect_failures: Arc<AtomicU32>,
    connect_calls: Arc<AtomicU32>,
    fail_open_queue: Arc<AtomicBool>,
}

impl InMemoryBackend {
    pub fn new(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        let connection = Arc::new(InMemoryConnection::new());
        Self {
            queue: Arc::new(InMemoryJobQueue::with_connection(
                queue_name.clone(),
                connection.clone(),
            )),
            dead_letter: Arc::new(InMemoryDeadLetterQueue::with_connection(
                format!("{queue_name}-dlq"),
                connection.clone(),
            )),
            connection,
            connect_failures: Arc::new(AtomicU32::new(0)),
            connect_calls: Arc::new(AtomicU32::new(0)),
            fail_open_queue: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connection(&self) -> &Arc<InMemoryConnection> {
        &self.connection
    }

    pub fn queue(&self) -> &Arc<InMemoryJobQueue> {
        &self.queue
    }

    pub fn dead_letter(&self) -> &Arc<InMemoryDeadLetterQueue> {
        &self.dead_letter
    }

    /// The next `count` connects fail.
    pub fn fail_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_open_queue(&self, fail: bool) {
        self.fail_open_queue.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<Arc<InMemoryConnection>, StoreError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("connection refused".to_string()));
        }

        self.connection.reopen();
        Ok(self.connection.clone())
    }

    async fn open_dead_letter(
        &self,
        _connection: &Arc<InMemoryConnection>,
    ) -> Result<Arc<dyn DeadLetterQueue>, StoreError> {
        self.dead_letter.reopen();
        Ok(self.dead_letter.clone())
    }

    async fn open_queue(
        &self,
        _connection: &Arc<InMemoryConnection>,
    ) -> Result<Arc<dyn JobQueue>, StoreError> {
        if self.fail_open_queue.load(Ordering::SeqCst) {
            return Err(StoreError::Command("queue unavailable".to_string()));
        }
        self.queue.reopen();
        Ok(self.queue.clone())
    }
}
