use uuid::Uuid;

use crate::{
    api::error,
    modules::message::{
        model::{InsertMessage, MessagePage},
        schema::{MessageEntity, ReactionEntity},
    },
};

#[async_trait::async_trait]
pub trait MessageRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<MessageEntity>, error::SystemError>;

    /// Inserts the message and bumps the conversation's activity time.
    async fn create(&self, message: &InsertMessage) -> Result<MessageEntity, error::SystemError>;

    /// Replaces the body of a live message written by `sender_id`.
    async fn update_body(
        &self,
        id: i64,
        sender_id: &Uuid,
        body: &str,
    ) -> Result<Option<MessageEntity>, error::SystemError>;

    /// Marks a live message deleted; `None` if it was already gone.
    async fn soft_delete(&self, id: i64) -> Result<Option<MessageEntity>, error::SystemError>;

    /// One reaction per user and message; a new type replaces the old one.
    async fn upsert_reaction(
        &self,
        message_id: i64,
        user_id: &Uuid,
        reaction_type: &str,
    ) -> Result<ReactionEntity, error::SystemError>;

    async fn delete_reaction(
        &self,
        message_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError>;

    async fn find_page(
        &self,
        conversation_id: i64,
        page: &MessagePage,
    ) -> Result<Vec<MessageEntity>, error::SystemError>;

    async fn find_reactions(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<ReactionEntity>, error::SystemError>;

    /// Case-insensitive substring search over live messages in
    /// conversations the user participates in.
    async fn search(
        &self,
        user_id: &Uuid,
        text: &str,
        conversation_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageEntity>, error::SystemError>;
}
