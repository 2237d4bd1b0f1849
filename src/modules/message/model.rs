use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::modules::message::schema::{Attachment, MessageEntity, ReactionEntity};

#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<i64>,
}

/// Draft as submitted by a client, over REST or the socket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionView {
    pub user_id: Uuid,
    pub reaction_type: String,
}

impl From<ReactionEntity> for ReactionView {
    fn from(entity: ReactionEntity) -> Self {
        ReactionView { user_id: entity.user_id, reaction_type: entity.reaction_type }
    }
}

/// Message as delivered to clients. Deleted messages keep their slot in
/// history with the body and attachments blanked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<i64>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<ReactionView>,
}

impl From<MessageEntity> for MessageView {
    fn from(entity: MessageEntity) -> Self {
        let (body, attachments) = if entity.deleted {
            (None, vec![])
        } else {
            (entity.body, entity.attachments.map(|a| a.0).unwrap_or_default())
        };

        MessageView {
            id: entity.id,
            conversation_id: entity.conversation_id,
            sender_id: entity.sender_id,
            body,
            attachments,
            reply_to_id: entity.reply_to_id,
            edited: entity.edited,
            edited_at: entity.edited_at,
            deleted: entity.deleted,
            deleted_at: entity.deleted_at,
            created_at: entity.created_at,
            reactions: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub id: Uuid,
    pub display_name: String,
}

/// Reverse-chronological page: newest first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessagePage {
    pub before_id: Option<i64>,
    pub after_id: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MessageListQuery {
    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    pub limit: Option<i64>,
    #[validate(range(min = 0, message = "Offset cannot be negative"))]
    pub offset: Option<i64>,
    pub before_id: Option<i64>,
    pub after_id: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    #[validate(length(min = 1, max = 200, message = "Query must be 1-200 characters"))]
    pub q: String,
    pub conversation_id: Option<i64>,
    #[validate(range(min = 1, max = 50, message = "Limit must be between 1 and 50"))]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageBody {
    pub body: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReactBody {
    pub reaction_type: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageBody {
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<i64>,
}

impl From<PostMessageBody> for NewMessage {
    fn from(value: PostMessageBody) -> Self {
        NewMessage { body: value.body, attachments: value.attachments, reply_to_id: value.reply_to_id }
    }
}
