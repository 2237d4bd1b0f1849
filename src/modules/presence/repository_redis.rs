use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, AsyncCommands};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::{
    api::error,
    modules::presence::{model::Departure, repository::PresenceStore},
};

/// Redis key schema:
/// - `presence:conns:{user_id}` set of live connection handles
/// - `presence:heartbeats` sorted set of user ids scored by last heartbeat (ms)
/// - `presence:last_seen:{user_id}` RFC 3339 time the user went offline
///
/// Every transition runs as one Lua script, so a register on one instance
/// and a departure or sweep on another never interleave.
const CONNS_PREFIX: &str = "presence:conns:";
const HEARTBEATS_KEY: &str = "presence:heartbeats";
const LAST_SEEN_PREFIX: &str = "presence:last_seen:";

/// KEYS: conns, heartbeats. ARGV: handle, conns ttl, user id, now ms.
/// Returns 1 when this handle is the user's first.
static ADD_CONNECTION: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local added = redis.call('SADD', KEYS[1], ARGV[1])
        local count = redis.call('SCARD', KEYS[1])
        redis.call('EXPIRE', KEYS[1], ARGV[2])
        redis.call('ZADD', KEYS[2], ARGV[4], ARGV[3])
        if added == 1 and count == 1 then
            return 1
        end
        return 0
        ",
    )
});

/// KEYS: conns, heartbeats, last seen. ARGV: handle, user id, now.
/// Returns 0 for an unknown handle, 1 while other handles remain and 2 when
/// the user went offline.
static REMOVE_CONNECTION: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('SREM', KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        if redis.call('SCARD', KEYS[1]) > 0 then
            return 1
        end
        redis.call('ZREM', KEYS[2], ARGV[2])
        redis.call('SET', KEYS[3], ARGV[3])
        return 2
        ",
    )
});

/// KEYS: conns, heartbeats. ARGV: user id, now ms, conns ttl.
static TOUCH: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return 0
        end
        redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        return 1
        ",
    )
});

/// KEYS: heartbeats, conns, last seen. ARGV: user id, cutoff ms, now.
/// Returns 1 only for the call that evicted the user.
static EXPIRE_ONE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
        if not score or tonumber(score) > tonumber(ARGV[2]) then
            return 0
        end
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('DEL', KEYS[2])
        redis.call('SET', KEYS[3], ARGV[3])
        return 1
        ",
    )
});

#[derive(Clone)]
pub struct RedisPresenceStore {
    pool: deadpool_redis::Pool,
    /// Safety expiry on connection sets, in seconds.
    conns_ttl: i64,
}

impl RedisPresenceStore {
    pub fn new(pool: deadpool_redis::Pool, presence_ttl: std::time::Duration) -> Self {
        Self { pool, conns_ttl: (presence_ttl.as_secs() as i64).max(1) * 2 }
    }
}

fn conns_key(user_id: &Uuid) -> String {
    format!("{CONNS_PREFIX}{user_id}")
}

fn last_seen_key(user_id: &Uuid) -> String {
    format!("{LAST_SEEN_PREFIX}{user_id}")
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc))
}

fn departure(code: i64, now: DateTime<Utc>) -> Departure {
    match code {
        2 => Departure::WentOffline { at: now },
        1 => Departure::StillOnline,
        _ => Departure::Unknown,
    }
}

#[async_trait::async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_connection(
        &self,
        user_id: &Uuid,
        handle: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, error::SystemError> {
        let mut conn = self.pool.get().await?;

        let first: i64 = ADD_CONNECTION
            .key(conns_key(user_id))
            .key(HEARTBEATS_KEY)
            .arg(handle.to_string())
            .arg(self.conns_ttl)
            .arg(user_id.to_string())
            .arg(now.timestamp_millis())
            .invoke_async(&mut *conn)
            .await?;

        Ok(first == 1)
    }

    async fn remove_connection(
        &self,
        user_id: &Uuid,
        handle: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Departure, error::SystemError> {
        let mut conn = self.pool.get().await?;

        let code: i64 = REMOVE_CONNECTION
            .key(conns_key(user_id))
            .key(HEARTBEATS_KEY)
            .key(last_seen_key(user_id))
            .arg(handle.to_string())
            .arg(user_id.to_string())
            .arg(now.to_rfc3339())
            .invoke_async(&mut *conn)
            .await?;

        Ok(departure(code, now))
    }

    async fn touch(&self, user_id: &Uuid, now: DateTime<Utc>) -> Result<bool, error::SystemError> {
        let mut conn = self.pool.get().await?;

        let refreshed: i64 = TOUCH
            .key(conns_key(user_id))
            .key(HEARTBEATS_KEY)
            .arg(user_id.to_string())
            .arg(now.timestamp_millis())
            .arg(self.conns_ttl)
            .invoke_async(&mut *conn)
            .await?;

        Ok(refreshed == 1)
    }

    async fn online(&self, user_ids: &[Uuid]) -> Result<Vec<bool>, error::SystemError> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.pool.get().await?;

        let mut pipe = redis::pipe();
        for user_id in user_ids {
            pipe.exists(conns_key(user_id));
        }
        let flags: Vec<bool> = pipe.query_async(&mut *conn).await?;
        Ok(flags)
    }

    async fn last_seen(
        &self,
        user_ids: &[Uuid],
    ) -> Result<Vec<Option<DateTime<Utc>>>, error::SystemError> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.pool.get().await?;

        let mut pipe = redis::pipe();
        for user_id in user_ids {
            pipe.get(last_seen_key(user_id));
        }
        let raw: Vec<Option<String>> = pipe.query_async(&mut *conn).await?;
        Ok(raw.into_iter().map(parse_time).collect())
    }

    async fn expire_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, error::SystemError> {
        let mut conn = self.pool.get().await?;

        let candidates: Vec<String> = conn
            .zrangebyscore(HEARTBEATS_KEY, "-inf", cutoff.timestamp_millis())
            .await?;

        let mut expired = Vec::new();
        for raw in candidates {
            let Ok(user_id) = Uuid::parse_str(&raw) else {
                log::warn!("Dropping malformed presence member {raw:?}");
                conn.zrem::<_, _, ()>(HEARTBEATS_KEY, &raw).await?;
                continue;
            };

            // the score is checked again inside the script; a fresh heartbeat wins
            let evicted: i64 = EXPIRE_ONE
                .key(HEARTBEATS_KEY)
                .key(conns_key(&user_id))
                .key(last_seen_key(&user_id))
                .arg(&raw)
                .arg(cutoff.timestamp_millis())
                .arg(now.to_rfc3339())
                .invoke_async(&mut *conn)
                .await?;
            if evicted == 1 {
                expired.push(user_id);
            }
        }

        Ok(expired)
    }
}
