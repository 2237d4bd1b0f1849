use uuid::Uuid;

use crate::{
    api::error,
    modules::conversation::{
        model::{AddParticipant, ConversationSummary, ReadAdvance},
        schema::{ConversationEntity, ParticipantEntity},
    },
};

#[async_trait::async_trait]
pub trait ConversationRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<ConversationEntity>, error::SystemError>;

    /// Returns the direct conversation of the pair, creating it when absent.
    /// The flag is true only for the call that created it.
    async fn find_or_create_direct(
        &self,
        user_a: &Uuid,
        user_b: &Uuid,
    ) -> Result<(ConversationEntity, bool), error::SystemError>;

    /// Creates the group with the creator and `member_ids` as participants.
    async fn create_group(
        &self,
        created_by: &Uuid,
        name: &str,
        description: Option<&str>,
        member_ids: &[Uuid],
    ) -> Result<ConversationEntity, error::SystemError>;

    async fn is_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError>;

    async fn find_participants(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ParticipantEntity>, error::SystemError>;

    async fn add_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
        max_participants: usize,
    ) -> Result<AddParticipant, error::SystemError>;

    /// True when a row was removed.
    async fn remove_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError>;

    /// Conversations of the user, most recently active first.
    async fn find_summaries_by_user(
        &self,
        user_id: &Uuid,
    ) -> Result<Vec<ConversationSummary>, error::SystemError>;

    /// Moves the marker forward only; never lowers it.
    async fn advance_read_marker(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
        message_id: i64,
    ) -> Result<ReadAdvance, error::SystemError>;
}
