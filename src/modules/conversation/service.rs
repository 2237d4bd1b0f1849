use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

use crate::{
    api::error,
    constants::MAX_GROUP_PARTICIPANTS,
    modules::{
        cache::{conversation_list_key, CacheService, Ttl},
        conversation::{
            model::{
                AddParticipant, ConversationDetail, ConversationSummary, ParticipantView,
                ReadAdvance, ReadMarker,
            },
            repository::ConversationRepository,
            schema::{ConversationEntity, ConversationType},
        },
        message::repository::MessageRepository,
        user::{identity::Identity, service::UserService},
        websocket::{
            broadcaster::{publish_or_log, Broadcaster, BusMessage, Envelope},
            message::ServerMessage,
        },
    },
};

#[derive(Clone)]
pub struct ConversationService {
    conversation_repo: Arc<dyn ConversationRepository + Send + Sync>,
    message_repo: Arc<dyn MessageRepository + Send + Sync>,
    users: UserService,
    cache: CacheService,
    broadcaster: Arc<dyn Broadcaster>,
    list_ttl: Ttl,
}

impl ConversationService {
    pub fn with_dependencies(
        conversation_repo: Arc<dyn ConversationRepository + Send + Sync>,
        message_repo: Arc<dyn MessageRepository + Send + Sync>,
        users: UserService,
        cache: CacheService,
        broadcaster: Arc<dyn Broadcaster>,
        list_ttl: Ttl,
    ) -> Self {
        log::info!("ConversationService initialized with dependencies");
        ConversationService { conversation_repo, message_repo, users, cache, broadcaster, list_ttl }
    }

    /// The conversation, provided `user_id` participates in it.
    pub async fn require_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
    ) -> Result<ConversationEntity, error::SystemError> {
        let conversation = self
            .conversation_repo
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| error::SystemError::not_found("Conversation not found"))?;

        if !self.conversation_repo.is_participant(conversation_id, user_id).await? {
            return Err(error::SystemError::not_a_participant());
        }
        Ok(conversation)
    }

    pub async fn list_for_user(
        &self,
        user_id: &Uuid,
    ) -> Result<Vec<ConversationSummary>, error::SystemError> {
        self.cache
            .get_or_load(&conversation_list_key(user_id), self.list_ttl, || async {
                self.conversation_repo.find_summaries_by_user(user_id).await
            })
            .await
    }

    pub async fn conversation_ids_for_user(
        &self,
        user_id: &Uuid,
    ) -> Result<Vec<i64>, error::SystemError> {
        let summaries = self.list_for_user(user_id).await?;
        Ok(summaries.into_iter().map(|s| s.id).collect())
    }

    pub async fn get_detail(
        &self,
        identity: &Identity,
        conversation_id: i64,
    ) -> Result<ConversationDetail, error::SystemError> {
        let conversation = self.require_participant(conversation_id, &identity.user_id).await?;
        let participants = self.conversation_repo.find_participants(conversation_id).await?;

        let ids: Vec<Uuid> = participants.iter().map(|p| p.user_id).collect();
        let profiles: HashMap<Uuid, _> =
            self.users.get_profiles(&ids).await?.into_iter().map(|p| (p.id, p)).collect();

        let participants = participants
            .into_iter()
            .map(|p| {
                let profile = profiles.get(&p.user_id);
                ParticipantView {
                    user_id: p.user_id,
                    display_name: profile.map(|u| u.display_name.clone()).unwrap_or_default(),
                    avatar_url: profile.and_then(|u| u.avatar_url.clone()),
                    joined_at: p.joined_at,
                    last_read_message_id: p.last_read_message_id,
                    read_at: p.read_at,
                }
            })
            .collect();

        Ok(ConversationDetail {
            id: conversation.id,
            kind: conversation.kind,
            name: conversation.name,
            description: conversation.description,
            created_by: conversation.created_by,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            participants,
        })
    }

    /// Returns the one direct conversation between the two users, creating
    /// it on first use. Concurrent calls for the same pair agree on one row.
    pub async fn create_direct(
        &self,
        identity: &Identity,
        other_id: Uuid,
    ) -> Result<ConversationSummary, error::SystemError> {
        if other_id == identity.user_id {
            return Err(error::SystemError::validation(
                "A direct conversation needs another user",
            ));
        }
        self.users.get_profile(other_id).await?;

        let (conversation, created) =
            self.conversation_repo.find_or_create_direct(&identity.user_id, &other_id).await?;

        let members = vec![identity.user_id, other_id];
        let summary = ConversationSummary::from_entity(conversation, members.clone());

        if created {
            log::info!("Direct conversation {} created by {}", summary.id, identity.user_id);
            self.invalidate_lists(&members).await;
            self.announce_created(&summary).await;
        }
        Ok(summary)
    }

    pub async fn create_group(
        &self,
        identity: &Identity,
        name: &str,
        description: Option<&str>,
        member_ids: &[Uuid],
    ) -> Result<ConversationSummary, error::SystemError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(error::SystemError::validation("Group name cannot be empty"));
        }

        let mut members: Vec<Uuid> = Vec::with_capacity(member_ids.len());
        for id in member_ids {
            if *id != identity.user_id && !members.contains(id) {
                members.push(*id);
            }
        }
        if members.is_empty() {
            return Err(error::SystemError::validation("A group needs at least one other member"));
        }
        if members.len() + 1 > MAX_GROUP_PARTICIPANTS {
            return Err(error::SystemError::validation(format!(
                "A group holds at most {MAX_GROUP_PARTICIPANTS} participants"
            )));
        }

        let known = self.users.get_profiles(&members).await?;
        if known.len() != members.len() {
            return Err(error::SystemError::not_found("One or more members do not exist"));
        }

        let description = description.map(str::trim).filter(|d| !d.is_empty());
        let conversation = self
            .conversation_repo
            .create_group(&identity.user_id, name, description, &members)
            .await?;

        let mut participant_ids = vec![identity.user_id];
        participant_ids.extend(members);
        let summary = ConversationSummary::from_entity(conversation, participant_ids);

        log::info!(
            "Group {} created by {} with {} participants",
            summary.id,
            identity.user_id,
            summary.participant_ids.len()
        );
        self.invalidate_lists(&summary.participant_ids).await;
        self.announce_created(&summary).await;
        Ok(summary)
    }

    /// Any participant of a group may add others, up to the group cap.
    pub async fn add_participant(
        &self,
        identity: &Identity,
        conversation_id: i64,
        user_id: Uuid,
    ) -> Result<(), error::SystemError> {
        let conversation = self.require_participant(conversation_id, &identity.user_id).await?;
        if conversation.kind == ConversationType::Direct {
            return Err(error::SystemError::validation(
                "Participants of a direct conversation cannot change",
            ));
        }
        self.users.get_profile(user_id).await?;

        match self
            .conversation_repo
            .add_participant(conversation_id, &user_id, MAX_GROUP_PARTICIPANTS)
            .await?
        {
            AddParticipant::Added => {}
            AddParticipant::AlreadyParticipant => return Ok(()),
            AddParticipant::GroupFull => {
                return Err(error::SystemError::validation(format!(
                    "A group holds at most {MAX_GROUP_PARTICIPANTS} participants"
                )))
            }
        }

        let participants = self.participant_ids(conversation_id).await?;
        self.invalidate_lists(&participants).await;

        let b = self.broadcaster.as_ref();
        publish_or_log(b, BusMessage::Join { user_id, conversation_id }).await;
        publish_or_log(
            b,
            BusMessage::Deliver(Envelope::to_conversation(
                conversation_id,
                ServerMessage::ParticipantAdded {
                    conversation_id,
                    user_id,
                    added_by: identity.user_id,
                },
            )),
        )
        .await;

        log::info!("User {user_id} added to conversation {conversation_id}");
        Ok(())
    }

    /// Participants may leave; removing someone else takes the creator or a
    /// moderator.
    pub async fn remove_participant(
        &self,
        identity: &Identity,
        conversation_id: i64,
        user_id: Uuid,
    ) -> Result<(), error::SystemError> {
        let conversation = self.require_participant(conversation_id, &identity.user_id).await?;
        if conversation.kind == ConversationType::Direct {
            return Err(error::SystemError::validation(
                "Participants of a direct conversation cannot change",
            ));
        }

        let is_self = user_id == identity.user_id;
        if !is_self && conversation.created_by != identity.user_id && !identity.is_moderator() {
            return Err(error::SystemError::forbidden(
                "Only the creator or a moderator can remove participants",
            ));
        }

        let mut affected = self.participant_ids(conversation_id).await?;
        if !self.conversation_repo.remove_participant(conversation_id, &user_id).await? {
            return Err(error::SystemError::not_found("User is not a participant"));
        }
        if !affected.contains(&user_id) {
            affected.push(user_id);
        }
        self.invalidate_lists(&affected).await;

        let b = self.broadcaster.as_ref();
        publish_or_log(
            b,
            BusMessage::Deliver(Envelope::to_conversation(
                conversation_id,
                ServerMessage::ParticipantRemoved {
                    conversation_id,
                    user_id,
                    removed_by: identity.user_id,
                },
            )),
        )
        .await;
        publish_or_log(b, BusMessage::Leave { user_id, conversation_id }).await;

        log::info!("User {user_id} removed from conversation {conversation_id}");
        Ok(())
    }

    /// Advances the caller's read marker. Re-reading the same message is a
    /// no-op; pointing it backwards is rejected.
    pub async fn mark_read(
        &self,
        identity: &Identity,
        origin: Option<Uuid>,
        conversation_id: i64,
        message_id: i64,
    ) -> Result<ReadMarker, error::SystemError> {
        self.require_participant(conversation_id, &identity.user_id).await?;

        let belongs = self
            .message_repo
            .find_by_id(message_id)
            .await?
            .is_some_and(|m| m.conversation_id == conversation_id);
        if !belongs {
            return Err(error::SystemError::not_found("Message not found in this conversation"));
        }

        match self
            .conversation_repo
            .advance_read_marker(conversation_id, &identity.user_id, message_id)
            .await?
        {
            ReadAdvance::Advanced(marker) => {
                let event = ServerMessage::ConversationRead {
                    conversation_id,
                    user_id: identity.user_id,
                    last_read_message_id: marker.last_read_message_id,
                    read_at: marker.read_at,
                };
                publish_or_log(
                    self.broadcaster.as_ref(),
                    BusMessage::Deliver(
                        Envelope::to_conversation(conversation_id, event)
                            .skip_connection(origin)
                            .skip_user(identity.user_id),
                    ),
                )
                .await;
                Ok(marker)
            }
            ReadAdvance::Unchanged(marker) => Ok(marker),
            ReadAdvance::Regressed { current } => Err(error::SystemError::validation(format!(
                "Read marker is already at message {current}"
            ))),
            ReadAdvance::NotParticipant => Err(error::SystemError::not_a_participant()),
        }
    }

    async fn participant_ids(&self, conversation_id: i64) -> Result<Vec<Uuid>, error::SystemError> {
        let participants = self.conversation_repo.find_participants(conversation_id).await?;
        Ok(participants.into_iter().map(|p| p.user_id).collect())
    }

    /// Drops the cached conversation lists of every participant once new
    /// activity has moved the conversation up.
    pub async fn invalidate_participant_lists(&self, conversation_id: i64) {
        if !self.cache.is_enabled() {
            return;
        }
        match self.participant_ids(conversation_id).await {
            Ok(participants) => self.invalidate_lists(&participants).await,
            Err(e) => log::error!(
                "Cannot invalidate conversation lists for conversation {conversation_id}: {e}"
            ),
        }
    }

    async fn invalidate_lists(&self, user_ids: &[Uuid]) {
        let keys: Vec<String> = user_ids.iter().map(conversation_list_key).collect();
        self.cache.del(&keys).await;
    }

    /// Moves online participants into the new room and tells their devices.
    async fn announce_created(&self, summary: &ConversationSummary) {
        let b = self.broadcaster.as_ref();
        for user_id in &summary.participant_ids {
            publish_or_log(b, BusMessage::Join { user_id: *user_id, conversation_id: summary.id })
                .await;
            publish_or_log(
                b,
                BusMessage::Deliver(Envelope::to_user(
                    *user_id,
                    ServerMessage::ConversationCreated { conversation: summary.clone() },
                )),
            )
            .await;
        }
    }
}
