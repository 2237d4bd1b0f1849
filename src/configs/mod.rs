use deadpool_redis::{redis, Runtime};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{api::error, constants::Env};

pub async fn connect_database(env: &Env) -> Result<PgPool, error::SystemError> {
    let pool = PgPoolOptions::new()
        .max_connections(env.db_max_connections)
        .min_connections(1)
        .acquire_slow_threshold(std::time::Duration::from_secs(3))
        .connect(&env.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Builds the shared Redis pool and proves it reachable with a PING.
///
/// Returns `None` when Redis is not configured or not reachable; the server
/// then runs with the cache disabled and single-instance presence.
pub async fn connect_redis(env: &Env) -> Option<deadpool_redis::Pool> {
    let url = env.redis_url.as_deref()?;

    match try_connect_redis(url, env.redis_pool_size).await {
        Ok(pool) => {
            log::info!("Connected to Redis at {url}");
            Some(pool)
        }
        Err(e) => {
            log::warn!("Redis unreachable ({e}), running in single-instance mode");
            None
        }
    }
}

async fn try_connect_redis(
    url: &str,
    max_size: usize,
) -> Result<deadpool_redis::Pool, error::SystemError> {
    let mut cfg = deadpool_redis::Config::from_url(url);
    cfg.pool = Some(deadpool_redis::PoolConfig { max_size, ..Default::default() });
    let pool = cfg.create_pool(Some(Runtime::Tokio1))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<()>(&mut *conn).await?;

    Ok(pool)
}
