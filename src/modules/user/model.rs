use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::modules::{presence::model::PresenceInfo, user::schema::UserEntity};

/// Profile as cached and returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl From<UserEntity> for UserProfile {
    fn from(entity: UserEntity) -> Self {
        UserProfile {
            id: entity.id,
            display_name: entity.display_name,
            avatar_url: entity.avatar_url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWithPresence {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub presence: PresenceInfo,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PresenceQuery {
    #[validate(length(min = 1, max = 200, message = "Between 1 and 200 user ids"))]
    pub user_ids: Vec<Uuid>,
}
