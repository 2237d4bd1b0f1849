use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

use crate::{
    api::error,
    constants::{
        DEFAULT_PAGE_SIZE, MAX_ATTACHMENTS, MAX_MESSAGE_LENGTH, MAX_PAGE_SIZE, MAX_SEARCH_RESULTS,
    },
    modules::{
        conversation::service::ConversationService,
        message::{
            model::{InsertMessage, MessagePage, MessageView, NewMessage, ReactionView, SenderInfo},
            repository::MessageRepository,
            schema::MessageEntity,
        },
        user::identity::Identity,
        websocket::{
            broadcaster::{publish_or_log, Broadcaster, BusMessage, Envelope},
            message::ServerMessage,
        },
    },
};

const MAX_REACTION_LENGTH: usize = 32;

/// Message writes shared by the socket and REST paths. Every write is
/// committed first and then published to the conversation room; `origin`
/// is the connection that asked for it, which gets an ack instead of the
/// broadcast.
#[derive(Clone)]
pub struct MessageService {
    message_repo: Arc<dyn MessageRepository + Send + Sync>,
    conversations: ConversationService,
    broadcaster: Arc<dyn Broadcaster>,
}

fn validate_body(body: &str) -> Result<(), error::SystemError> {
    if body.trim().is_empty() {
        return Err(error::SystemError::validation("Message body cannot be empty"));
    }
    if body.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(error::SystemError::validation(format!(
            "Message body is limited to {MAX_MESSAGE_LENGTH} characters"
        )));
    }
    Ok(())
}

fn validate_draft(draft: &NewMessage) -> Result<(), error::SystemError> {
    let has_body = draft.body.as_deref().is_some_and(|b| !b.trim().is_empty());
    if !has_body && draft.attachments.is_empty() {
        return Err(error::SystemError::validation("Message needs a body or an attachment"));
    }
    if let Some(body) = draft.body.as_deref().filter(|_| has_body) {
        validate_body(body)?;
    }
    if draft.attachments.len() > MAX_ATTACHMENTS {
        return Err(error::SystemError::validation(format!(
            "At most {MAX_ATTACHMENTS} attachments per message"
        )));
    }
    if draft.attachments.iter().any(|a| a.url.trim().is_empty()) {
        return Err(error::SystemError::validation("Attachment url cannot be empty"));
    }
    Ok(())
}

fn page_of(
    limit: Option<i64>,
    offset: Option<i64>,
    before_id: Option<i64>,
    after_id: Option<i64>,
) -> MessagePage {
    MessagePage {
        before_id,
        after_id,
        limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        offset: offset.unwrap_or(0).max(0),
    }
}

impl MessageService {
    pub fn with_dependencies(
        message_repo: Arc<dyn MessageRepository + Send + Sync>,
        conversations: ConversationService,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        log::info!("MessageService initialized with dependencies");
        MessageService { message_repo, conversations, broadcaster }
    }

    async fn publish(&self, conversation_id: i64, origin: Option<Uuid>, event: ServerMessage) {
        publish_or_log(
            self.broadcaster.as_ref(),
            BusMessage::Deliver(
                Envelope::to_conversation(conversation_id, event).skip_connection(origin),
            ),
        )
        .await;
    }

    async fn find_visible(
        &self,
        identity: &Identity,
        message_id: i64,
    ) -> Result<MessageEntity, error::SystemError> {
        let message = self
            .message_repo
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| error::SystemError::not_found("Message not found"))?;

        self.conversations.require_participant(message.conversation_id, &identity.user_id).await?;
        Ok(message)
    }

    async fn with_reactions(
        &self,
        messages: Vec<MessageEntity>,
    ) -> Result<Vec<MessageView>, error::SystemError> {
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        let mut by_message: HashMap<i64, Vec<ReactionView>> = HashMap::new();
        for reaction in self.message_repo.find_reactions(&ids).await? {
            by_message.entry(reaction.message_id).or_default().push(reaction.into());
        }

        Ok(messages
            .into_iter()
            .map(|m| {
                let reactions = by_message.remove(&m.id).unwrap_or_default();
                let mut view = MessageView::from(m);
                if !view.deleted {
                    view.reactions = reactions;
                }
                view
            })
            .collect())
    }

    pub async fn send(
        &self,
        identity: &Identity,
        origin: Option<Uuid>,
        conversation_id: i64,
        draft: NewMessage,
    ) -> Result<MessageView, error::SystemError> {
        validate_draft(&draft)?;
        self.conversations.require_participant(conversation_id, &identity.user_id).await?;

        if let Some(reply_to) = draft.reply_to_id {
            let target = self.message_repo.find_by_id(reply_to).await?;
            if !target.is_some_and(|m| m.conversation_id == conversation_id) {
                return Err(error::SystemError::validation(
                    "Reply target is not part of this conversation",
                ));
            }
        }

        let body = draft.body.filter(|b| !b.trim().is_empty());
        let entity = self
            .message_repo
            .create(&InsertMessage {
                conversation_id,
                sender_id: identity.user_id,
                body,
                attachments: draft.attachments,
                reply_to_id: draft.reply_to_id,
            })
            .await?;

        let view = MessageView::from(entity);
        log::debug!("Message {} stored in conversation {conversation_id}", view.id);
        self.conversations.invalidate_participant_lists(conversation_id).await;

        self.publish(
            conversation_id,
            origin,
            ServerMessage::NewMessage {
                conversation_id,
                message: view.clone(),
                sender: SenderInfo {
                    id: identity.user_id,
                    display_name: identity.display_name.clone(),
                },
            },
        )
        .await;

        Ok(view)
    }

    pub async fn edit(
        &self,
        identity: &Identity,
        origin: Option<Uuid>,
        message_id: i64,
        body: &str,
    ) -> Result<MessageView, error::SystemError> {
        validate_body(body)?;
        let message = self.find_visible(identity, message_id).await?;

        if message.deleted {
            return Err(error::SystemError::validation("Deleted messages cannot be edited"));
        }
        if message.sender_id != identity.user_id {
            return Err(error::SystemError::forbidden("Only the author can edit a message"));
        }

        let updated = self
            .message_repo
            .update_body(message_id, &identity.user_id, body)
            .await?
            .ok_or_else(|| error::SystemError::not_found("Message not found"))?;

        let conversation_id = updated.conversation_id;
        let view = self
            .with_reactions(vec![updated])
            .await?
            .pop()
            .ok_or_else(|| error::SystemError::not_found("Message not found"))?;

        self.publish(
            conversation_id,
            origin,
            ServerMessage::MessageEdited { conversation_id, message: view.clone() },
        )
        .await;

        Ok(view)
    }

    /// Soft delete by the author or a moderator. Deleting twice succeeds
    /// without a second broadcast.
    pub async fn delete(
        &self,
        identity: &Identity,
        origin: Option<Uuid>,
        message_id: i64,
    ) -> Result<MessageView, error::SystemError> {
        let message = self.find_visible(identity, message_id).await?;

        if message.sender_id != identity.user_id && !identity.is_moderator() {
            return Err(error::SystemError::forbidden(
                "Only the author or a moderator can delete a message",
            ));
        }
        if message.deleted {
            return Ok(MessageView::from(message));
        }

        let Some(deleted) = self.message_repo.soft_delete(message_id).await? else {
            let current = self.find_visible(identity, message_id).await?;
            return Ok(MessageView::from(current));
        };

        let conversation_id = deleted.conversation_id;
        log::info!("Message {message_id} deleted by {}", identity.user_id);
        self.publish(
            conversation_id,
            origin,
            ServerMessage::MessageDeleted { conversation_id, message_id },
        )
        .await;

        Ok(MessageView::from(deleted))
    }

    pub async fn react(
        &self,
        identity: &Identity,
        origin: Option<Uuid>,
        message_id: i64,
        reaction_type: &str,
    ) -> Result<ReactionView, error::SystemError> {
        let reaction_type = reaction_type.trim();
        if reaction_type.is_empty() || reaction_type.chars().count() > MAX_REACTION_LENGTH {
            return Err(error::SystemError::validation(format!(
                "Reaction must be 1-{MAX_REACTION_LENGTH} characters"
            )));
        }

        let message = self.find_visible(identity, message_id).await?;
        if message.deleted {
            return Err(error::SystemError::validation("Deleted messages cannot be reacted to"));
        }

        let reaction =
            self.message_repo.upsert_reaction(message_id, &identity.user_id, reaction_type).await?;

        self.publish(
            message.conversation_id,
            origin,
            ServerMessage::ReactionAdded {
                conversation_id: message.conversation_id,
                message_id,
                user_id: identity.user_id,
                reaction_type: reaction.reaction_type.clone(),
            },
        )
        .await;

        Ok(reaction.into())
    }

    /// Removes the caller's reaction; true when one existed.
    pub async fn unreact(
        &self,
        identity: &Identity,
        origin: Option<Uuid>,
        message_id: i64,
    ) -> Result<bool, error::SystemError> {
        let message = self.find_visible(identity, message_id).await?;

        let removed = self.message_repo.delete_reaction(message_id, &identity.user_id).await?;
        if removed {
            self.publish(
                message.conversation_id,
                origin,
                ServerMessage::ReactionRemoved {
                    conversation_id: message.conversation_id,
                    message_id,
                    user_id: identity.user_id,
                },
            )
            .await;
        }
        Ok(removed)
    }

    pub async fn get_message(
        &self,
        identity: &Identity,
        message_id: i64,
    ) -> Result<MessageView, error::SystemError> {
        let message = self.find_visible(identity, message_id).await?;
        self.with_reactions(vec![message])
            .await?
            .pop()
            .ok_or_else(|| error::SystemError::not_found("Message not found"))
    }

    pub async fn list(
        &self,
        identity: &Identity,
        conversation_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
        before_id: Option<i64>,
        after_id: Option<i64>,
    ) -> Result<Vec<MessageView>, error::SystemError> {
        self.conversations.require_participant(conversation_id, &identity.user_id).await?;

        let page = page_of(limit, offset, before_id, after_id);
        let messages = self.message_repo.find_page(conversation_id, &page).await?;
        self.with_reactions(messages).await
    }

    pub async fn search(
        &self,
        identity: &Identity,
        text: &str,
        conversation_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<MessageView>, error::SystemError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(error::SystemError::validation("Search query cannot be empty"));
        }
        if let Some(id) = conversation_id {
            self.conversations.require_participant(id, &identity.user_id).await?;
        }

        let limit = limit.unwrap_or(MAX_SEARCH_RESULTS).clamp(1, MAX_SEARCH_RESULTS);
        let messages =
            self.message_repo.search(&identity.user_id, text, conversation_id, limit).await?;
        self.with_reactions(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::MODERATOR_PERMISSION,
        modules::{cache::CacheService, message::schema::Attachment},
        test::{Fixture, MemoryCache},
    };

    fn text(body: &str) -> NewMessage {
        NewMessage { body: Some(body.to_string()), ..Default::default() }
    }

    #[tokio::test]
    async fn test_send_broadcasts_to_room_except_origin() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        let origin = Uuid::now_v7();

        let message = fx.messages.send(&ana, Some(origin), direct.id, text("hello")).await.unwrap();

        let envelope = fx.broadcaster.last_delivered().unwrap();
        assert_eq!(envelope.skip_connection, Some(origin));
        assert_eq!(envelope.skip_user, None);
        match envelope.event {
            ServerMessage::NewMessage { conversation_id, message: sent, sender } => {
                assert_eq!(conversation_id, direct.id);
                assert_eq!(sent, message);
                assert_eq!(sender.display_name, "Ana");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_moves_conversation_up_in_cached_lists() {
        let fx = Fixture::with_cache(CacheService::new(Arc::new(MemoryCache::default())));
        let (ana, bao, cam) = (fx.user("Ana").await, fx.user("Bao").await, fx.user("Cam").await);
        let older = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = fx.conversations.create_direct(&ana, cam.user_id).await.unwrap();

        let before = fx.conversations.list_for_user(&ana.user_id).await.unwrap();
        assert_eq!(before.iter().map(|c| c.id).collect::<Vec<_>>(), vec![newer.id, older.id]);
        let bao_before = fx.conversations.list_for_user(&bao.user_id).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        fx.send(&bao, older.id, "bump").await;

        let after = fx.conversations.list_for_user(&ana.user_id).await.unwrap();
        assert_eq!(after.iter().map(|c| c.id).collect::<Vec<_>>(), vec![older.id, newer.id]);
        let bao_after = fx.conversations.list_for_user(&bao.user_id).await.unwrap();
        assert!(bao_after[0].updated_at > bao_before[0].updated_at);
    }

    #[tokio::test]
    async fn test_ids_increase_in_send_order() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();

        let first = fx.send(&ana, direct.id, "1").await;
        let second = fx.send(&bao, direct.id, "2").await;
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_non_participant_cannot_send_and_nothing_is_broadcast() {
        let fx = Fixture::new();
        let (ana, bao, eve) = (fx.user("Ana").await, fx.user("Bao").await, fx.user("Eve").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        let before = fx.broadcaster.delivered().len();

        let err = fx.messages.send(&eve, None, direct.id, text("hi")).await.unwrap_err();
        assert_eq!(err.code(), "NotAParticipant");
        assert_eq!(fx.broadcaster.delivered().len(), before);

        let err = fx.messages.send(&eve, None, 404, text("hi")).await.unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[tokio::test]
    async fn test_draft_validation() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();

        let cases = vec![
            NewMessage::default(),
            text("   "),
            text(&"x".repeat(MAX_MESSAGE_LENGTH + 1)),
            NewMessage {
                attachments: vec![
                    Attachment { url: "u".into(), name: None, mime_type: None, size: None };
                    MAX_ATTACHMENTS + 1
                ],
                ..Default::default()
            },
            NewMessage { reply_to_id: Some(12_345), ..text("reply") },
        ];

        for draft in cases {
            let err = fx.messages.send(&ana, None, direct.id, draft).await.unwrap_err();
            assert_eq!(err.code(), "ValidationError");
        }

        let attachment_only = NewMessage {
            attachments: vec![Attachment {
                url: "https://files/cat.png".into(),
                name: Some("cat.png".into()),
                mime_type: Some("image/png".into()),
                size: Some(42),
            }],
            ..Default::default()
        };
        let sent = fx.messages.send(&ana, None, direct.id, attachment_only).await.unwrap();
        assert!(sent.body.is_none());
        assert_eq!(sent.attachments.len(), 1);
    }

    #[tokio::test]
    async fn test_only_author_edits() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        let message = fx.send(&ana, direct.id, "draft").await;

        let err = fx.messages.edit(&bao, None, message.id, "hijack").await.unwrap_err();
        assert_eq!(err.code(), "Forbidden");

        let edited = fx.messages.edit(&ana, None, message.id, "final").await.unwrap();
        assert!(edited.edited);
        assert!(edited.edited_at.is_some());
        assert_eq!(edited.body.as_deref(), Some("final"));
        assert!(matches!(
            fx.broadcaster.last_delivered().unwrap().event,
            ServerMessage::MessageEdited { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_final() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        let message = fx.send(&ana, direct.id, "oops").await;

        let err = fx.messages.delete(&bao, None, message.id).await.unwrap_err();
        assert_eq!(err.code(), "Forbidden");

        let deleted = fx.messages.delete(&ana, None, message.id).await.unwrap();
        assert!(deleted.deleted);
        assert!(deleted.body.is_none());

        let broadcasts = fx.broadcaster.delivered().len();
        fx.messages.delete(&ana, None, message.id).await.unwrap();
        assert_eq!(fx.broadcaster.delivered().len(), broadcasts);

        let err = fx.messages.edit(&ana, None, message.id, "undo").await.unwrap_err();
        assert_eq!(err.code(), "ValidationError");
        let err = fx.messages.react(&bao, None, message.id, "👍").await.unwrap_err();
        assert_eq!(err.code(), "ValidationError");

        // the slot stays in history
        let history = fx.messages.list(&bao, direct.id, None, None, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].deleted);
    }

    #[tokio::test]
    async fn test_moderator_deletes_any_message() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let group = fx.conversations.create_group(&ana, "g", None, &[bao.user_id]).await.unwrap();
        let message = fx.send(&ana, group.id, "rule breaking").await;

        let mut moderator = bao.clone();
        moderator.permissions = vec![MODERATOR_PERMISSION.to_string()];
        assert!(fx.messages.delete(&moderator, None, message.id).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_one_reaction_per_user_replaced_then_removed() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        let message = fx.send(&ana, direct.id, "news").await;

        fx.messages.react(&bao, None, message.id, "👍").await.unwrap();
        fx.messages.react(&bao, None, message.id, "🎉").await.unwrap();

        let view = fx.messages.get_message(&ana, message.id).await.unwrap();
        assert_eq!(
            view.reactions,
            vec![ReactionView { user_id: bao.user_id, reaction_type: "🎉".into() }]
        );

        assert!(fx.messages.unreact(&bao, None, message.id).await.unwrap());
        assert!(!fx.messages.unreact(&bao, None, message.id).await.unwrap());
        assert!(fx.messages.get_message(&ana, message.id).await.unwrap().reactions.is_empty());

        let err = fx.messages.react(&bao, None, message.id, &"x".repeat(33)).await.unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    #[tokio::test]
    async fn test_list_pages_newest_first() {
        let fx = Fixture::new();
        let (ana, bao) = (fx.user("Ana").await, fx.user("Bao").await);
        let direct = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        let mut ids = vec![];
        for i in 0..5 {
            ids.push(fx.send(&ana, direct.id, &format!("m{i}")).await.id);
        }

        let page = fx.messages.list(&bao, direct.id, Some(2), None, None, None).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let older =
            fx.messages.list(&bao, direct.id, Some(10), None, Some(ids[3]), None).await.unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);

        let newer =
            fx.messages.list(&bao, direct.id, Some(10), Some(1), None, Some(ids[1])).await.unwrap();
        assert_eq!(newer.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn test_search_is_scoped_to_own_conversations() {
        let fx = Fixture::new();
        let (ana, bao, eve) = (fx.user("Ana").await, fx.user("Bao").await, fx.user("Eve").await);
        let ours = fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();
        let theirs = fx.conversations.create_direct(&bao, eve.user_id).await.unwrap();
        fx.send(&ana, ours.id, "Lunch at noon?").await;
        fx.send(&eve, theirs.id, "lunch is secret").await;

        let hits = fx.messages.search(&ana, "LUNCH", None, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_id, ours.id);

        let err = fx.messages.search(&ana, "lunch", Some(theirs.id), None).await.unwrap_err();
        assert_eq!(err.code(), "NotAParticipant");
        assert!(fx.messages.search(&ana, "  ", None, None).await.is_err());
    }

    #[test]
    fn test_page_is_clamped() {
        assert_eq!(page_of(None, None, None, None).limit, DEFAULT_PAGE_SIZE);
        assert_eq!(page_of(Some(1_000), Some(-3), None, None).limit, MAX_PAGE_SIZE);
        assert_eq!(page_of(Some(0), Some(-3), None, None).offset, 0);
    }
}
