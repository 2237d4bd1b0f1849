use deadpool_redis::redis;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::{
    api::error,
    modules::rate_limit::{RateDecision, RateLimiter, RateRule},
};

const KEY_PREFIX: &str = "ratelimit:";

/// KEYS: window. ARGV: now ms, window ms, member, max requests.
/// Returns `{1, remaining}` when admitted and `{0, retry_ms}` otherwise.
static CHECK_WINDOW: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local max = tonumber(ARGV[4])
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
        local count = redis.call('ZCARD', KEYS[1])
        if count < max then
            redis.call('ZADD', KEYS[1], now, ARGV[3])
            redis.call('PEXPIRE', KEYS[1], window)
            return {1, max - count - 1}
        end
        local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
        local retry = window
        if oldest[2] then
            retry = math.max(tonumber(oldest[2]) + window - now, 0)
        end
        return {0, retry}
        ",
    )
});

/// Shared sliding windows stored as one sorted set per identifier, scored by
/// the millisecond timestamp of each admitted request.
///
/// Trim, count and admission run in one script, so a rejected attempt never
/// occupies a slot and every instance sees the same window.
#[derive(Clone)]
pub struct RedisRateLimiter {
    pool: deadpool_redis::Pool,
}

impl RedisRateLimiter {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

fn decision((admitted, value): (i64, i64)) -> RateDecision {
    if admitted == 1 {
        RateDecision::allow(value.max(0) as u32)
    } else {
        RateDecision::deny(std::time::Duration::from_millis(value.max(0) as u64))
    }
}

#[async_trait::async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(
        &self,
        identifier: &str,
        rule: RateRule,
    ) -> Result<RateDecision, error::SystemError> {
        let mut conn = self.pool.get().await?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = rule.window.as_millis() as i64;

        let reply: (i64, i64) = CHECK_WINDOW
            .key(format!("{KEY_PREFIX}{identifier}"))
            .arg(now_ms)
            .arg(window_ms)
            .arg(format!("{now_ms}-{}", Uuid::now_v7()))
            .arg(rule.max_requests)
            .invoke_async(&mut *conn)
            .await?;

        Ok(decision(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_script_reply_maps_to_decision() {
        assert_eq!(decision((1, 4)), RateDecision::allow(4));
        assert_eq!(decision((0, 1500)), RateDecision::deny(Duration::from_millis(1500)));
        assert_eq!(decision((0, 1500)).retry_after_secs(), 2);
        assert_eq!(decision((0, -3)), RateDecision::deny(Duration::ZERO));
    }
}
