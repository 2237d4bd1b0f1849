/// WebSocket Message Protocol
///
/// Every frame is a JSON text frame shaped `{"event": .., "ref": .., "data": ..}`.
/// `ref` is an opaque client correlation id; it is never part of the event
/// payload and is echoed only on `ack` and `error` frames.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::modules::{
    conversation::model::ConversationSummary,
    message::{
        model::{MessageView, SenderInfo},
        schema::Attachment,
    },
    presence::model::PresenceInfo,
};

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "message:send", rename_all = "camelCase")]
    SendMessage {
        conversation_id: i64,
        body: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
        reply_to: Option<i64>,
    },

    #[serde(rename = "message:edit", rename_all = "camelCase")]
    EditMessage { message_id: i64, body: String },

    #[serde(rename = "message:delete", rename_all = "camelCase")]
    DeleteMessage { message_id: i64 },

    #[serde(rename = "message:react", rename_all = "camelCase")]
    React { message_id: i64, reaction_type: String },

    #[serde(rename = "message:unreact", rename_all = "camelCase")]
    Unreact { message_id: i64 },

    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart { conversation_id: i64 },

    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { conversation_id: i64 },

    #[serde(rename = "conversation:read", rename_all = "camelCase")]
    MarkRead { conversation_id: i64, last_read_message_id: i64 },

    #[serde(rename = "conversation:join", rename_all = "camelCase")]
    JoinConversation { conversation_id: i64 },

    #[serde(rename = "conversation:leave", rename_all = "camelCase")]
    LeaveConversation { conversation_id: i64 },

    #[serde(rename = "presence:query", rename_all = "camelCase")]
    PresenceQuery { user_ids: Vec<Uuid> },

    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::SendMessage { .. } => "message:send",
            ClientMessage::EditMessage { .. } => "message:edit",
            ClientMessage::DeleteMessage { .. } => "message:delete",
            ClientMessage::React { .. } => "message:react",
            ClientMessage::Unreact { .. } => "message:unreact",
            ClientMessage::TypingStart { .. } => "typing:start",
            ClientMessage::TypingStop { .. } => "typing:stop",
            ClientMessage::MarkRead { .. } => "conversation:read",
            ClientMessage::JoinConversation { .. } => "conversation:join",
            ClientMessage::LeaveConversation { .. } => "conversation:leave",
            ClientMessage::PresenceQuery { .. } => "presence:query",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Events sent by the server, either as direct replies or via room fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "auth:success", rename_all = "camelCase")]
    AuthSuccess { user_id: Uuid, conversation_ids: Vec<i64> },

    /// Reply to the originating connection; `result` depends on `event`.
    #[serde(rename = "ack")]
    Ack { event: String, result: Value },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },

    #[serde(rename = "message:new", rename_all = "camelCase")]
    NewMessage { conversation_id: i64, message: MessageView, sender: SenderInfo },

    #[serde(rename = "message:edited", rename_all = "camelCase")]
    MessageEdited { conversation_id: i64, message: MessageView },

    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted { conversation_id: i64, message_id: i64 },

    #[serde(rename = "message:reaction:added", rename_all = "camelCase")]
    ReactionAdded { conversation_id: i64, message_id: i64, user_id: Uuid, reaction_type: String },

    #[serde(rename = "message:reaction:removed", rename_all = "camelCase")]
    ReactionRemoved { conversation_id: i64, message_id: i64, user_id: Uuid },

    #[serde(rename = "typing:user", rename_all = "camelCase")]
    Typing { conversation_id: i64, user_id: Uuid, display_name: String, is_typing: bool },

    #[serde(rename = "conversation:read", rename_all = "camelCase")]
    ConversationRead {
        conversation_id: i64,
        user_id: Uuid,
        last_read_message_id: i64,
        read_at: DateTime<Utc>,
    },

    #[serde(rename = "conversation:created", rename_all = "camelCase")]
    ConversationCreated { conversation: ConversationSummary },

    #[serde(rename = "conversation:participant:added", rename_all = "camelCase")]
    ParticipantAdded { conversation_id: i64, user_id: Uuid, added_by: Uuid },

    #[serde(rename = "conversation:participant:removed", rename_all = "camelCase")]
    ParticipantRemoved { conversation_id: i64, user_id: Uuid, removed_by: Uuid },

    #[serde(rename = "user:online", rename_all = "camelCase")]
    UserOnline { user_id: Uuid },

    #[serde(rename = "user:offline", rename_all = "camelCase")]
    UserOffline { user_id: Uuid, last_seen: DateTime<Utc> },

    #[serde(rename = "presence:state", rename_all = "camelCase")]
    PresenceState { users: Vec<PresenceInfo> },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(event: Option<&str>, err: &crate::api::error::SystemError) -> Self {
        ServerMessage::Error {
            event: event.map(str::to_string),
            code: err.code().to_string(),
            message: err.client_message(),
            retry_after: err.retry_after(),
        }
    }
}

/// Inbound frame that could not be turned into a `ClientMessage`.
#[derive(Debug)]
pub struct FrameError {
    pub reference: Option<String>,
    pub event: Option<String>,
    pub reason: String,
}

/// Splits a text frame into its correlation id and event.
pub fn parse_frame(text: &str) -> Result<(Option<String>, ClientMessage), FrameError> {
    let mut value: Value = serde_json::from_str(text).map_err(|e| FrameError {
        reference: None,
        event: None,
        reason: format!("Malformed JSON: {e}"),
    })?;

    let Some(object) = value.as_object_mut() else {
        return Err(FrameError {
            reference: None,
            event: None,
            reason: "Frame must be a JSON object".to_string(),
        });
    };

    let reference = object.remove("ref").and_then(|r| match r {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    });
    let event = object.get("event").and_then(Value::as_str).map(str::to_string);

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => Ok((reference, message)),
        Err(e) => Err(FrameError {
            reference,
            reason: match &event {
                Some(name) => format!("Invalid payload for {name}: {e}"),
                None => "Frame has no event".to_string(),
            },
            event,
        }),
    }
}

/// Serializes an outbound event, adding `ref` when replying to a frame.
pub fn encode_frame(
    reference: Option<&str>,
    message: &ServerMessage,
) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(message)?;
    if let (Some(reference), Some(object)) = (reference, value.as_object_mut()) {
        object.insert("ref".to_string(), Value::String(reference.to_string()));
    }
    serde_json::to_string(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_with_ref() {
        let text = json!({
            "event": "message:send",
            "ref": "c-1",
            "data": {"conversationId": 7, "body": "hi", "replyTo": 3}
        })
        .to_string();

        let (reference, message) = parse_frame(&text).unwrap();
        assert_eq!(reference.as_deref(), Some("c-1"));
        assert_eq!(
            message,
            ClientMessage::SendMessage {
                conversation_id: 7,
                body: Some("hi".into()),
                attachments: vec![],
                reply_to: Some(3),
            }
        );
    }

    #[test]
    fn test_parse_ping_without_data() {
        let (reference, message) = parse_frame(r#"{"event":"ping","ref":5}"#).unwrap();
        assert_eq!(reference.as_deref(), Some("5"));
        assert_eq!(message, ClientMessage::Ping);
    }

    #[test]
    fn test_parse_errors_keep_ref_and_event() {
        let err = parse_frame(r#"{"event":"message:edit","ref":"x","data":{"body":"b"}}"#)
            .unwrap_err();
        assert_eq!(err.reference.as_deref(), Some("x"));
        assert_eq!(err.event.as_deref(), Some("message:edit"));

        let err = parse_frame(r#"{"event":"no:such","data":{}}"#).unwrap_err();
        assert_eq!(err.event.as_deref(), Some("no:such"));

        let err = parse_frame("[1,2]").unwrap_err();
        assert!(err.reference.is_none());
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn test_encode_typing_frame() {
        let user_id = Uuid::now_v7();
        let frame = encode_frame(
            None,
            &ServerMessage::Typing {
                conversation_id: 4,
                user_id,
                display_name: "Ana".into(),
                is_typing: true,
            },
        )
        .unwrap();

        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "typing:user",
                "data": {
                    "conversationId": 4,
                    "userId": user_id,
                    "displayName": "Ana",
                    "isTyping": true
                }
            })
        );
    }

    #[test]
    fn test_error_frame_echoes_ref() {
        let err = crate::api::error::SystemError::RateLimited { retry_after: 4 };
        let frame =
            encode_frame(Some("r9"), &ServerMessage::error(Some("message:send"), &err)).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["event"], "error");
        assert_eq!(value["ref"], "r9");
        assert_eq!(value["data"]["code"], "RateLimited");
        assert_eq!(value["data"]["retryAfter"], 4);
        assert_eq!(value["data"]["event"], "message:send");
    }

    #[test]
    fn test_pong_has_no_data() {
        let frame = encode_frame(None, &ServerMessage::Pong).unwrap();
        assert_eq!(frame, r#"{"event":"pong"}"#);
    }

    #[test]
    fn test_every_client_event_name_matches_its_tag() {
        let samples = vec![
            ClientMessage::Auth { token: "t".into() },
            ClientMessage::Unreact { message_id: 1 },
            ClientMessage::MarkRead { conversation_id: 1, last_read_message_id: 2 },
            ClientMessage::PresenceQuery { user_ids: vec![] },
            ClientMessage::Ping,
        ];
        for sample in samples {
            let value = serde_json::to_value(&sample).unwrap();
            assert_eq!(value["event"], sample.name());
        }
    }
}
