/// Read-through cache with mandatory TTLs.
///
/// The cache is an optimisation only: every backend failure is logged and
/// treated as a miss, and a missing backend disables caching altogether.
///
/// A read-through fill first leaves a token under `<key>:fill` and only
/// stores the loaded value while that token is still there. Invalidation
/// drops the token with the entry, so a load racing a write never caches
/// the pre-write value.
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, num::NonZeroU64, sync::Arc};
use uuid::Uuid;

use crate::api::error;

pub mod redis;

/// Expiry in seconds. Zero is unrepresentable so no entry can live forever.
pub type Ttl = NonZeroU64;

pub fn profile_key(user_id: &Uuid) -> String {
    format!("user:{user_id}:profile")
}

pub fn conversation_list_key(user_id: &Uuid) -> String {
    format!("user:{user_id}:conversations")
}

pub fn user_pattern(user_id: &Uuid) -> String {
    format!("user:{user_id}:*")
}

fn fill_key(key: &str) -> String {
    format!("{key}:fill")
}

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, error::SystemError>;

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Ttl)
        -> Result<(), error::SystemError>;

    /// Stores `value` under `key` only if `fill_key` still holds `token`,
    /// consuming the token. Must be atomic.
    async fn complete_fill(
        &self,
        key: &str,
        fill_key: &str,
        token: &[u8],
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<bool, error::SystemError>;

    async fn del(&self, keys: &[String]) -> Result<(), error::SystemError>;

    /// Deletes every key matching a glob pattern, returning how many went.
    async fn del_pattern(&self, pattern: &str) -> Result<u64, error::SystemError>;
}

#[derive(Clone)]
pub struct CacheService {
    backend: Option<Arc<dyn CacheBackend>>,
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend: Some(backend) }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;

        match backend.get_raw(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("Dropping undecodable cache entry {key}: {e}");
                    self.del(&[key.to_string()]).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Cache read failed for {key}, falling through: {e}");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Ttl) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };

        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Cannot serialize cache entry {key}: {e}");
                return;
            }
        };

        if let Err(e) = backend.set_raw(key, bytes, ttl).await {
            log::warn!("Cache write failed for {key}: {e}");
        }
    }

    pub async fn del(&self, keys: &[String]) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if keys.is_empty() {
            return;
        }

        let keys: Vec<String> =
            keys.iter().cloned().chain(keys.iter().map(|k| fill_key(k))).collect();
        if let Err(e) = backend.del(&keys).await {
            log::error!("Cache invalidation failed for {keys:?}: {e}");
        }
    }

    pub async fn del_pattern(&self, pattern: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };

        match backend.del_pattern(pattern).await {
            Ok(count) => log::debug!("Invalidated {count} cache keys matching {pattern}"),
            Err(e) => log::error!("Cache invalidation failed for pattern {pattern}: {e}"),
        }
    }

    /// Returns the cached value, or loads it from the store and caches it.
    /// Store errors propagate; cache errors never do.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Ttl,
        load: F,
    ) -> Result<T, error::SystemError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, error::SystemError>>,
    {
        let Some(backend) = self.backend.as_ref() else {
            return load().await;
        };
        if let Some(hit) = self.get::<T>(key).await {
            log::debug!("Cache hit {key}");
            return Ok(hit);
        }

        let fill = fill_key(key);
        let token = Uuid::now_v7().to_string();
        self.set(&fill, &token, ttl).await;

        let value = load().await?;

        let (Ok(claim), Ok(bytes)) = (serde_json::to_vec(&token), serde_json::to_vec(&value)) else {
            log::error!("Cannot serialize cache entry {key}");
            return Ok(value);
        };
        match backend.complete_fill(key, &fill, &claim, bytes, ttl).await {
            Ok(true) => {}
            Ok(false) => log::debug!("Skipping fill of {key}, invalidated during load"),
            Err(e) => log::warn!("Cache write failed for {key}: {e}"),
        }
        Ok(value)
    }
}
