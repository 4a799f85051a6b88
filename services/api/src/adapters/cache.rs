//! services/api/src/adapters/cache.rs
//!
//! Redis implementation of the `LockCache` port. Lock acquisition is a single
//! `SET NX EX` and release is a Lua compare-and-delete, so neither needs a
//! separate read.

use async_trait::async_trait;
use coupon_book_core::ports::{LockCache, PortError, PortResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

/// Deletes KEYS[1] only while it still holds ARGV[1].
///
/// Returns 1 when the key was removed, 0 otherwise.
pub const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLockCache {
    manager: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisLockCache {
    /// Opens a self-reconnecting connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
        })
    }
}

fn cache_error(e: redis::RedisError) -> PortError {
    PortError::Unexpected(format!("cache: {}", e))
}

#[async_trait]
impl LockCache for RedisLockCache {
    async fn get(&self, key: &str) -> PortResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await.map_err(cache_error)?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> PortResult<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> PortResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await.map_err(cache_error)?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PortResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(removed > 0)
    }
}
