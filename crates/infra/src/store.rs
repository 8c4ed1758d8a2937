//! Store connection lifecycle shared by the lock, queue, and dead-letter adapters.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, error};

/// Store-level error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store connection is closed")]
    Closed,
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A connection to the shared key-value store.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Round-trip to the store. `Ok` once it can serve commands.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Close the connection. Later commands fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;

    fn is_closed(&self) -> bool;
}

/// Rate-limits connection error logs while a worker is not ready.
///
/// Reconnect loops report the same failure over and over; before readiness only the
/// first report of each unready window is logged, the rest are counted.
#[derive(Debug, Default)]
pub struct ConnectionErrorLog {
    ready: AtomicBool,
    logged_while_unready: AtomicBool,
    suppressed: AtomicU64,
}

impl ConnectionErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an error. Returns whether it was logged.
    pub fn report(&self, context: &str, err: &StoreError) -> bool {
        if self.ready.load(Ordering::SeqCst) {
            error!(context, error = %err, "store connection error");
            return true;
        }

        if self.logged_while_unready.swap(true, Ordering::SeqCst) {
            self.suppressed.fetch_add(1, Ordering::SeqCst);
            debug!(context, error = %err, "suppressed repeated store connection error");
            return false;
        }

        error!(context, error = %err, "store connection error before worker became ready");
        true
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Start a new unready window (e.g. at the beginning of `start()`).
    pub fn mark_unready(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.logged_while_unready.store(false, Ordering::SeqCst);
        self.suppressed.store(0, Ordering::SeqCst);
    }

    /// Errors suppressed in the current unready window.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::SeqCst)
    }
}

/// In-process connection for single-instance mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryConnection {
    closed: AtomicBool,
    unready_pings: AtomicU32,
    fail_close: AtomicBool,
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `pings` pings fail, as if the store were still coming up.
    pub fn unready_for(&self, pings: u32) {
        self.unready_pings.store(pings, Ordering::SeqCst);
    }

    /// Make `close()` report an error (after closing).
    pub fn fail_on_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Reopen after a previous close.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnection for InMemoryConnection {
    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let remaining = self.unready_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.unready_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(StoreError::Command("close failed".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
