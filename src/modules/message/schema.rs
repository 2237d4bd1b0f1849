use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};
use uuid::Uuid;

/// File reference carried by a message; upload and storage live elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageEntity {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub body: Option<String>,
    pub attachments: Option<Json<Vec<Attachment>>>,
    pub reply_to_id: Option<i64>,
    pub edited: bool,
    pub edited_at: Option<chrono::DateTime<chrono::Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReactionEntity {
    pub message_id: i64,
    pub user_id: Uuid,
    pub reaction_type: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
