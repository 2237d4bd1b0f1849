use deadpool_redis::redis::{self, AsyncCommands};
use std::sync::LazyLock;

use crate::{
    api::error,
    modules::cache::{CacheBackend, Ttl},
};

/// KEYS: entry, fill token. ARGV: token, value, ttl seconds.
static COMPLETE_FILL: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('GET', KEYS[2]) ~= ARGV[1] then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
        redis.call('DEL', KEYS[2])
        return 1
        ",
    )
});

/// Redis-backed cache entries, stored as JSON bytes with `SET EX`.
pub struct RedisCache {
    pool: deadpool_redis::Pool,
}

impl RedisCache {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CacheBackend for RedisCache {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, error::SystemError> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<(), error::SystemError> {
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.get()).await?;
        Ok(())
    }

    async fn complete_fill(
        &self,
        key: &str,
        fill_key: &str,
        token: &[u8],
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<bool, error::SystemError> {
        let mut conn = self.pool.get().await?;
        let stored: i64 = COMPLETE_FILL
            .key(key)
            .key(fill_key)
            .arg(token)
            .arg(value)
            .arg(ttl.get())
            .invoke_async(&mut *conn)
            .await?;
        Ok(stored == 1)
    }

    async fn del(&self, keys: &[String]) -> Result<(), error::SystemError> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn del_pattern(&self, pattern: &str) -> Result<u64, error::SystemError> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        // incremental SCAN, never KEYS
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut *conn)
                .await?;

            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }
}
