use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ::redis::Script;

use super::connection::RedisConnection;
use crate::lock::LockStore;
use crate::store::StoreError;

const RELEASE_LUA: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

const EXTEND_LUA: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Lock store on a single Redis key: `SET NX PX` plus compare-and-act scripts.
pub struct RedisLockStore {
    connection: Arc<RedisConnection>,
    release_script: Script,
    extend_script: Script,
}

impl RedisLockStore {
    pub fn new(connection: Arc<RedisConnection>) -> Self {
        Self {
            connection,
            release_script: Script::new(RELEASE_LUA),
            extend_script: Script::new(EXTEND_LUA),
        }
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(RedisConnection::open(url)?)))
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.manager().await?;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_match(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.manager().await?;
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn expire_if_match(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.manager().await?;
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}
