use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use crate::store::{StoreConnection, StoreError};

/// `scheme://host:port` with credentials, database, and query removed.
pub fn summarize_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);

    if scheme.is_empty() {
        host.to_string()
    } else if host.is_empty() {
        format!("{scheme}://")
    } else {
        format!("{scheme}://{host}")
    }
}

/// A lazily established, auto-reconnecting Redis connection.
pub struct RedisConnection {
    client: ::redis::Client,
    dsn_summary: String,
    manager: Mutex<Option<ConnectionManager>>,
    closed: AtomicBool,
}

impl RedisConnection {
    /// Validate the URL. No network I/O happens until the first command.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let dsn_summary = summarize_dsn(url);
        let client = ::redis::Client::open(url).map_err(|e| {
            StoreError::Connection(format!("invalid Redis URL ({dsn_summary}): {e}"))
        })?;

        Ok(Self {
            client,
            dsn_summary,
            manager: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dsn_summary(&self) -> &str {
        &self.dsn_summary
    }

    /// Shared connection handle, connecting on first use.
    pub async fn manager(&self) -> Result<ConnectionManager, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| {
                StoreError::Connection(format!(
                    "failed to connect to Redis ({}): {e}",
                    self.dsn_summary
                ))
            })?;
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("dsn", &self.dsn_summary)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the last manager handle closes the socket.
        self.manager.lock().await.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
