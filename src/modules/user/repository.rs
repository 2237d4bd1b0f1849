use uuid::Uuid;

use crate::{api::error, modules::user::schema::UserEntity};

#[async_trait::async_trait]
pub trait UserRepository {
    async fn find_by_id(&self, id: &Uuid) -> Result<Option<UserEntity>, error::SystemError>;

    async fn find_many(&self, ids: &[Uuid]) -> Result<Vec<UserEntity>, error::SystemError>;

    /// Inserts or refreshes the profile. Returns true when a stored value changed.
    async fn upsert(
        &self,
        id: &Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<bool, error::SystemError>;
}
