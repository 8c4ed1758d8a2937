//! Distributed mutual-exclusion lock.
//!
//! A lock is a single key holding an opaque token with a TTL. Release and extend are
//! compare-and-act on the token, so a worker whose lock expired (and was re-acquired by
//! someone else) can never delete or prolong the new holder's lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::store::StoreError;

/// Atomic primitives a lock store must provide.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// SET-if-absent with expiry. `true` iff this call created the key.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Delete the key iff it currently holds `token`.
    async fn delete_if_match(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    /// Reset the key's expiry iff it currently holds `token`.
    async fn expire_if_match(&self, key: &str, token: &str, ttl: Duration)
    -> Result<bool, StoreError>;
}

/// Per-acquisition proof of ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// A fresh, never reused token.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock facade used by the sweep processor.
///
/// Store failures are logged and reported as `false`: an unreachable store means the
/// caller does not (or no longer) hold the lock.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub async fn acquire(&self, key: &str, token: &LockToken, ttl: Duration) -> bool {
        match self.store.set_if_absent(key, token.as_str(), ttl).await {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(lock_key = key, error = %err, "lock acquire failed; treating lock as busy");
                false
            }
        }
    }

    pub async fn release(&self, key: &str, token: &LockToken) -> bool {
        match self.store.delete_if_match(key, token.as_str()).await {
            Ok(released) => released,
            Err(err) => {
                warn!(lock_key = key, error = %err, "lock release failed");
                false
            }
        }
    }

    pub async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> bool {
        match self.store.expire_if_match(key, token.as_str(), ttl).await {
            Ok(extended) => extended,
            Err(err) => {
                warn!(lock_key = key, error = %err, "lock extend failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// In-process lock store for single-process deployments and tests.
///
/// Expiry follows the tokio clock, so paused-time tests can age locks.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, HeldLock>>,
    unreachable: AtomicBool,
    extend_calls: AtomicU64,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the store going away (every call errors) or coming back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Token currently holding `key`, if any and not expired.
    pub fn holder(&self, key: &str) -> Option<String> {
        let locks = self.locks.lock().unwrap();
        locks
            .get(key)
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.token.clone())
    }

    pub fn extend_calls(&self) -> u64 {
        self.extend_calls.load(Ordering::SeqCst)
    }

    /// Overwrite the holder regardless of the current token (another worker winning
    /// the key after our TTL lapsed).
    #[cfg(test)]
    pub(crate) fn force_holder(&self, key: &str, token: &str, ttl: Duration) {
        let mut locks = self.locks.lock().unwrap();
        locks.insert(
            key.to_string(),
            HeldLock {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("lock store unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();

        if let Some(held) = locks.get(key) {
            if held.expires_at > now {
                return Ok(false);
            }
        }

        locks.insert(
            key.to_string(),
            HeldLock {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_match(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();

        match locks.get(key) {
            Some(held) if held.token == token && held.expires_at > now => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_if_match(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();

        match locks.get_mut(key) {
            Some(held) if held.token == token && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
