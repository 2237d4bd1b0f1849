/// Event dispatch for authenticated sessions.
///
/// Maps each inbound event onto the same service calls the REST surface
/// uses. Failures are returned to the session, which reports them to the
/// originating connection only.
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    api::error,
    modules::{
        conversation::service::ConversationService,
        message::{model::NewMessage, service::MessageService},
        presence::service::PresenceService,
        rate_limit::service::{ActionClass, RateLimitService},
        user::identity::Identity,
        websocket::{
            broadcaster::{publish_or_log, Broadcaster, BusMessage, Envelope, Room},
            message::{ClientMessage, ServerMessage},
        },
    },
};

const MAX_PRESENCE_QUERY: usize = 200;

/// Fixed at authentication time for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    pub connection_id: Uuid,
    pub identity: Identity,
}

impl SessionDescriptor {
    pub fn new(identity: Identity) -> Self {
        Self { connection_id: Uuid::now_v7(), identity }
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoomChange {
    Join(Room),
    Leave(Room),
}

/// What the session does after an event succeeded.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    pub reply: Option<ServerMessage>,
    pub room_change: Option<RoomChange>,
}

impl Outcome {
    fn none() -> Self {
        Self::default()
    }

    fn reply(message: ServerMessage) -> Self {
        Self { reply: Some(message), room_change: None }
    }

    fn ack<T: Serialize>(event: &str, result: &T) -> Result<Self, error::SystemError> {
        Ok(Self::reply(ServerMessage::Ack {
            event: event.to_string(),
            result: serde_json::to_value(result)?,
        }))
    }

    fn with_room_change(mut self, change: RoomChange) -> Self {
        self.room_change = Some(change);
        self
    }
}

fn action_class(event: &ClientMessage) -> Option<ActionClass> {
    match event {
        ClientMessage::SendMessage { .. } => Some(ActionClass::Message),
        ClientMessage::EditMessage { .. }
        | ClientMessage::DeleteMessage { .. }
        | ClientMessage::React { .. }
        | ClientMessage::Unreact { .. }
        | ClientMessage::MarkRead { .. } => Some(ActionClass::Mutation),
        ClientMessage::TypingStart { .. } | ClientMessage::TypingStop { .. } => {
            Some(ActionClass::Typing)
        }
        _ => None,
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    messages: MessageService,
    conversations: ConversationService,
    presence: PresenceService,
    limiter: RateLimitService,
    broadcaster: Arc<dyn Broadcaster>,
}

impl Dispatcher {
    pub fn with_dependencies(
        messages: MessageService,
        conversations: ConversationService,
        presence: PresenceService,
        limiter: RateLimitService,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self { messages, conversations, presence, limiter, broadcaster }
    }

    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    pub fn conversations(&self) -> &ConversationService {
        &self.conversations
    }

    pub async fn dispatch(
        &self,
        session: &SessionDescriptor,
        event: ClientMessage,
    ) -> Result<Outcome, error::SystemError> {
        if let Some(class) = action_class(&event) {
            self.limiter.check(class, &session.user_id().to_string()).await?;
        }

        let identity = &session.identity;
        let origin = Some(session.connection_id);
        let name = event.name();

        match event {
            ClientMessage::Auth { .. } => {
                Err(error::SystemError::validation("Session is already authenticated"))
            }

            ClientMessage::SendMessage { conversation_id, body, attachments, reply_to } => {
                let draft = NewMessage { body, attachments, reply_to_id: reply_to };
                let message = self.messages.send(identity, origin, conversation_id, draft).await?;
                Outcome::ack(name, &message)
            }

            ClientMessage::EditMessage { message_id, body } => {
                let message = self.messages.edit(identity, origin, message_id, &body).await?;
                Outcome::ack(name, &message)
            }

            ClientMessage::DeleteMessage { message_id } => {
                let message = self.messages.delete(identity, origin, message_id).await?;
                Outcome::ack(
                    name,
                    &json!({ "conversationId": message.conversation_id, "messageId": message.id }),
                )
            }

            ClientMessage::React { message_id, reaction_type } => {
                let reaction =
                    self.messages.react(identity, origin, message_id, &reaction_type).await?;
                Outcome::ack(name, &reaction)
            }

            ClientMessage::Unreact { message_id } => {
                let removed = self.messages.unreact(identity, origin, message_id).await?;
                Outcome::ack(name, &json!({ "messageId": message_id, "removed": removed }))
            }

            ClientMessage::TypingStart { conversation_id } => {
                self.typing(session, conversation_id, true).await
            }

            ClientMessage::TypingStop { conversation_id } => {
                self.typing(session, conversation_id, false).await
            }

            ClientMessage::MarkRead { conversation_id, last_read_message_id } => {
                let marker = self
                    .conversations
                    .mark_read(identity, origin, conversation_id, last_read_message_id)
                    .await?;
                Outcome::ack(name, &marker)
            }

            ClientMessage::JoinConversation { conversation_id } => {
                self.conversations.require_participant(conversation_id, &identity.user_id).await?;
                Ok(Outcome::ack(name, &json!({ "conversationId": conversation_id }))?
                    .with_room_change(RoomChange::Join(Room::Conversation(conversation_id))))
            }

            ClientMessage::LeaveConversation { conversation_id } => {
                Ok(Outcome::ack(name, &json!({ "conversationId": conversation_id }))?
                    .with_room_change(RoomChange::Leave(Room::Conversation(conversation_id))))
            }

            ClientMessage::PresenceQuery { user_ids } => {
                if user_ids.is_empty() || user_ids.len() > MAX_PRESENCE_QUERY {
                    return Err(error::SystemError::validation(format!(
                        "Between 1 and {MAX_PRESENCE_QUERY} user ids"
                    )));
                }
                let users = self.presence.online_status_batch(&user_ids).await?;
                Ok(Outcome::reply(ServerMessage::PresenceState { users }))
            }

            ClientMessage::Ping => {
                if let Err(e) = self.presence.heartbeat(identity.user_id, session.connection_id).await
                {
                    tracing::warn!("Presence refresh on ping failed for {}: {e}", identity.user_id);
                }
                Ok(Outcome::reply(ServerMessage::Pong))
            }
        }
    }

    /// Typing is never stored and gets no ack.
    async fn typing(
        &self,
        session: &SessionDescriptor,
        conversation_id: i64,
        is_typing: bool,
    ) -> Result<Outcome, error::SystemError> {
        let user_id = session.user_id();
        self.conversations.require_participant(conversation_id, &user_id).await?;

        let event = ServerMessage::Typing {
            conversation_id,
            user_id,
            display_name: session.identity.display_name.clone(),
            is_typing,
        };
        publish_or_log(
            self.broadcaster.as_ref(),
            BusMessage::Deliver(Envelope::to_conversation(conversation_id, event).skip_user(user_id)),
        )
        .await;

        Ok(Outcome::none())
    }
}

/// `result` of an ack, for callers that only want the payload.
pub fn ack_result(outcome: &Outcome) -> Option<&Value> {
    match &outcome.reply {
        Some(ServerMessage::Ack { result, .. }) => Some(result),
        _ => None,
    }
}
