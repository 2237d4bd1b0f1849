use std::sync::Arc;
use uuid::Uuid;

use crate::api::error;
use crate::modules::cache::{profile_key, user_pattern, CacheService, Ttl};
use crate::modules::user::{identity::Identity, model::UserProfile, repository::UserRepository};

#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository + Send + Sync>,
    cache: CacheService,
    profile_ttl: Ttl,
}

impl UserService {
    pub fn with_dependencies(
        repo: Arc<dyn UserRepository + Send + Sync>,
        cache: CacheService,
        profile_ttl: Ttl,
    ) -> Self {
        log::info!("UserService initialized with dependencies");
        UserService { repo, cache, profile_ttl }
    }

    pub async fn get_profile(&self, id: Uuid) -> Result<UserProfile, error::SystemError> {
        self.cache
            .get_or_load(&profile_key(&id), self.profile_ttl, || async {
                self.repo
                    .find_by_id(&id)
                    .await?
                    .map(UserProfile::from)
                    .ok_or_else(|| error::SystemError::not_found("User not found"))
            })
            .await
    }

    pub async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<UserProfile>, error::SystemError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let users = self.repo.find_many(ids).await?;
        Ok(users.into_iter().map(UserProfile::from).collect())
    }

    /// Mirrors the identity service's view of the user into the local
    /// profile table, dropping cached entries when anything changed.
    pub async fn sync_identity(&self, identity: &Identity) -> Result<(), error::SystemError> {
        let changed = self.repo.upsert(&identity.user_id, &identity.display_name, None).await?;

        if changed {
            self.cache.del_pattern(&user_pattern(&identity.user_id)).await;
            log::info!("Profile of user {} refreshed from identity", identity.user_id);
        }
        Ok(())
    }
}
