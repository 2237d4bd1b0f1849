use serde::{Deserialize, Serialize};
use sqlx::prelude::{FromRow, Type};
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Type, Serialize, Deserialize)]
#[sqlx(type_name = "conversation_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

#[derive(Debug, Clone, FromRow)]
pub struct ConversationEntity {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub kind: ConversationType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_by: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ParticipantEntity {
    pub conversation_id: i64,
    pub user_id: Uuid,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub last_read_message_id: Option<i64>,
    pub read_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Canonical key of a direct conversation, independent of who started it.
pub fn direct_key(a: &Uuid, b: &Uuid) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}
