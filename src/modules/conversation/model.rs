use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::modules::conversation::schema::{ConversationEntity, ConversationType};

/// Conversation as listed for a user; this is also the cached shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participant_ids: Vec<Uuid>,
}

impl ConversationSummary {
    pub fn from_entity(entity: ConversationEntity, participant_ids: Vec<Uuid>) -> Self {
        ConversationSummary {
            id: entity.id,
            kind: entity.kind,
            name: entity.name,
            description: entity.description,
            created_by: entity.created_by,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
            participant_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_read_message_id: Option<i64>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetail {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participants: Vec<ParticipantView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMarker {
    pub conversation_id: i64,
    pub user_id: Uuid,
    pub last_read_message_id: i64,
    pub read_at: DateTime<Utc>,
}

/// Result of a conditional read-marker update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadAdvance {
    Advanced(ReadMarker),
    /// The marker already pointed at this message.
    Unchanged(ReadMarker),
    /// The marker is past this message; `current` is where it stays.
    Regressed { current: i64 },
    NotParticipant,
}

/// Result of adding a participant under the group cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddParticipant {
    Added,
    AlreadyParticipant,
    GroupFull,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewDirectConversation {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewGroupConversation {
    #[validate(length(min = 1, max = 100, message = "Group name must be 1-100 characters"))]
    pub name: String,
    #[validate(length(max = 500, message = "Description is limited to 500 characters"))]
    pub description: Option<String>,
    #[validate(length(max = 1000, message = "Too many members for one group"))]
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantBody {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    #[validate(range(min = 1, message = "Message id must be positive"))]
    pub last_read_message_id: i64,
}
