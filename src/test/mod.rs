//! In-memory doubles for the store, cache and broadcaster used by the
//! service, dispatcher and session tests.
#![allow(dead_code)]

use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    api::error,
    modules::{
        cache::{CacheBackend, CacheService, Ttl},
        conversation::{
            model::{AddParticipant, ConversationSummary, ReadAdvance, ReadMarker},
            repository::ConversationRepository,
            schema::{direct_key, ConversationEntity, ConversationType, ParticipantEntity},
            service::ConversationService,
        },
        message::{
            model::{InsertMessage, MessagePage, MessageView, NewMessage},
            repository::MessageRepository,
            schema::{MessageEntity, ReactionEntity},
            service::MessageService,
        },
        presence::{repository_memory::MemoryPresenceStore, service::PresenceService},
        rate_limit::{memory::MemoryRateLimiter, service::RateLimitService},
        user::{
            identity::Identity, repository::UserRepository, schema::UserEntity,
            service::UserService,
        },
        websocket::broadcaster::{Broadcaster, BusMessage, Envelope},
    },
};

pub fn identity(name: &str) -> Identity {
    Identity { user_id: Uuid::now_v7(), display_name: name.to_string(), permissions: vec![] }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/* ---------------------------------- cache --------------------------------- */

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

fn glob_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, error::SystemError> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Ttl) -> Result<(), error::SystemError> {
        let expires = Instant::now() + Duration::from_secs(ttl.get());
        lock(&self.entries).insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn complete_fill(
        &self,
        key: &str,
        fill_key: &str,
        token: &[u8],
        value: Vec<u8>,
        ttl: Ttl,
    ) -> Result<bool, error::SystemError> {
        let mut entries = lock(&self.entries);
        let now = Instant::now();
        let claimed = entries
            .get(fill_key)
            .is_some_and(|(held, expires)| held.as_slice() == token && *expires > now);
        if !claimed {
            return Ok(false);
        }
        entries.remove(fill_key);
        entries.insert(key.to_string(), (value, now + Duration::from_secs(ttl.get())));
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<(), error::SystemError> {
        let mut entries = lock(&self.entries);
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn del_pattern(&self, pattern: &str) -> Result<u64, error::SystemError> {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|key, _| !glob_matches(pattern, key));
        Ok((before - entries.len()) as u64)
    }
}

/// Backend that is always down.
pub struct FailingCache;

#[async_trait::async_trait]
impl CacheBackend for FailingCache {
    async fn get_raw(&self, _: &str) -> Result<Option<Vec<u8>>, error::SystemError> {
        Err(error::SystemError::backend_unavailable("cache"))
    }

    async fn set_raw(&self, _: &str, _: Vec<u8>, _: Ttl) -> Result<(), error::SystemError> {
        Err(error::SystemError::backend_unavailable("cache"))
    }

    async fn complete_fill(
        &self,
        _: &str,
        _: &str,
        _: &[u8],
        _: Vec<u8>,
        _: Ttl,
    ) -> Result<bool, error::SystemError> {
        Err(error::SystemError::backend_unavailable("cache"))
    }

    async fn del(&self, _: &[String]) -> Result<(), error::SystemError> {
        Err(error::SystemError::backend_unavailable("cache"))
    }

    async fn del_pattern(&self, _: &str) -> Result<u64, error::SystemError> {
        Err(error::SystemError::backend_unavailable("cache"))
    }
}

/* ------------------------------- broadcaster ------------------------------ */

#[derive(Default)]
pub struct RecordingBroadcaster {
    published: Mutex<Vec<BusMessage>>,
    failing: AtomicBool,
}

impl RecordingBroadcaster {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn bus(&self) -> Vec<BusMessage> {
        lock(&self.published).clone()
    }

    pub fn delivered(&self) -> Vec<Envelope> {
        self.bus()
            .into_iter()
            .filter_map(|m| match m {
                BusMessage::Deliver(envelope) => Some(envelope),
                _ => None,
            })
            .collect()
    }

    pub fn last_delivered(&self) -> Option<Envelope> {
        self.delivered().pop()
    }

    pub fn clear(&self) {
        lock(&self.published).clear();
    }
}

#[async_trait::async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn publish(&self, message: BusMessage) -> Result<(), error::SystemError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(error::SystemError::backend_unavailable("bus"));
        }
        lock(&self.published).push(message);
        Ok(())
    }
}

/* ---------------------------------- store --------------------------------- */

#[derive(Default)]
struct StoreState {
    users: HashMap<Uuid, UserEntity>,
    conversations: BTreeMap<i64, (ConversationEntity, Option<String>)>,
    participants: Vec<ParticipantEntity>,
    messages: BTreeMap<i64, MessageEntity>,
    reactions: Vec<ReactionEntity>,
    last_conversation_id: i64,
    last_message_id: i64,
}

impl StoreState {
    fn insert_conversation(
        &mut self,
        kind: ConversationType,
        created_by: &Uuid,
        name: Option<&str>,
        description: Option<&str>,
        key: Option<String>,
    ) -> ConversationEntity {
        self.last_conversation_id += 1;
        let now = Utc::now();
        let entity = ConversationEntity {
            id: self.last_conversation_id,
            kind,
            name: name.map(str::to_string),
            description: description.map(str::to_string),
            created_by: *created_by,
            created_at: now,
            updated_at: now,
        };
        self.conversations.insert(entity.id, (entity.clone(), key));
        entity
    }

    fn add_member(&mut self, conversation_id: i64, user_id: &Uuid) {
        if !self.is_member(conversation_id, user_id) {
            self.participants.push(ParticipantEntity {
                conversation_id,
                user_id: *user_id,
                joined_at: Utc::now(),
                last_read_message_id: None,
                read_at: None,
            });
        }
    }

    fn is_member(&self, conversation_id: i64, user_id: &Uuid) -> bool {
        self.participants
            .iter()
            .any(|p| p.conversation_id == conversation_id && p.user_id == *user_id)
    }

    fn members(&self, conversation_id: i64) -> Vec<ParticipantEntity> {
        self.participants.iter().filter(|p| p.conversation_id == conversation_id).cloned().collect()
    }
}

/// Store double implementing every repository over one mutex-guarded state.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn conversation_count(&self) -> usize {
        lock(&self.state).conversations.len()
    }
}

#[async_trait::async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, id: &Uuid) -> Result<Option<UserEntity>, error::SystemError> {
        Ok(lock(&self.state).users.get(id).cloned())
    }

    async fn find_many(&self, ids: &[Uuid]) -> Result<Vec<UserEntity>, error::SystemError> {
        let state = lock(&self.state);
        Ok(ids.iter().filter_map(|id| state.users.get(id).cloned()).collect())
    }

    async fn upsert(
        &self,
        id: &Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<bool, error::SystemError> {
        let mut state = lock(&self.state);
        let avatar_url = avatar_url.map(str::to_string);

        if let Some(existing) = state.users.get(id) {
            if existing.display_name == display_name && existing.avatar_url == avatar_url {
                return Ok(false);
            }
        }

        state.users.insert(
            *id,
            UserEntity {
                id: *id,
                display_name: display_name.to_string(),
                avatar_url,
                updated_at: Utc::now(),
            },
        );
        Ok(true)
    }
}

#[async_trait::async_trait]
impl ConversationRepository for MemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<ConversationEntity>, error::SystemError> {
        Ok(lock(&self.state).conversations.get(&id).map(|(c, _)| c.clone()))
    }

    async fn find_or_create_direct(
        &self,
        user_a: &Uuid,
        user_b: &Uuid,
    ) -> Result<(ConversationEntity, bool), error::SystemError> {
        let key = direct_key(user_a, user_b);
        let mut state = lock(&self.state);

        let existing = state
            .conversations
            .values()
            .find(|(_, k)| k.as_deref() == Some(key.as_str()))
            .map(|(c, _)| c.clone());
        if let Some(conversation) = existing {
            return Ok((conversation, false));
        }

        let conversation =
            state.insert_conversation(ConversationType::Direct, user_a, None, None, Some(key));
        state.add_member(conversation.id, user_a);
        state.add_member(conversation.id, user_b);
        Ok((conversation, true))
    }

    async fn create_group(
        &self,
        created_by: &Uuid,
        name: &str,
        description: Option<&str>,
        member_ids: &[Uuid],
    ) -> Result<ConversationEntity, error::SystemError> {
        let mut state = lock(&self.state);
        let conversation = state.insert_conversation(
            ConversationType::Group,
            created_by,
            Some(name),
            description,
            None,
        );
        state.add_member(conversation.id, created_by);
        for id in member_ids {
            state.add_member(conversation.id, id);
        }
        Ok(conversation)
    }

    async fn is_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError> {
        Ok(lock(&self.state).is_member(conversation_id, user_id))
    }

    async fn find_participants(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ParticipantEntity>, error::SystemError> {
        Ok(lock(&self.state).members(conversation_id))
    }

    async fn add_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
        max_participants: usize,
    ) -> Result<AddParticipant, error::SystemError> {
        let mut state = lock(&self.state);
        if state.is_member(conversation_id, user_id) {
            return Ok(AddParticipant::AlreadyParticipant);
        }
        if state.members(conversation_id).len() >= max_participants {
            return Ok(AddParticipant::GroupFull);
        }
        state.add_member(conversation_id, user_id);
        Ok(AddParticipant::Added)
    }

    async fn remove_participant(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError> {
        let mut state = lock(&self.state);
        let before = state.participants.len();
        state.participants.retain(|p| !(p.conversation_id == conversation_id && p.user_id == *user_id));
        Ok(state.participants.len() < before)
    }

    async fn find_summaries_by_user(
        &self,
        user_id: &Uuid,
    ) -> Result<Vec<ConversationSummary>, error::SystemError> {
        let state = lock(&self.state);
        let mut summaries: Vec<ConversationSummary> = state
            .conversations
            .values()
            .filter(|(c, _)| state.is_member(c.id, user_id))
            .map(|(c, _)| {
                let ids = state.members(c.id).into_iter().map(|p| p.user_id).collect();
                ConversationSummary::from_entity(c.clone(), ids)
            })
            .collect();

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(summaries)
    }

    async fn advance_read_marker(
        &self,
        conversation_id: i64,
        user_id: &Uuid,
        message_id: i64,
    ) -> Result<ReadAdvance, error::SystemError> {
        let mut state = lock(&self.state);
        let Some(participant) = state
            .participants
            .iter_mut()
            .find(|p| p.conversation_id == conversation_id && p.user_id == *user_id)
        else {
            return Ok(ReadAdvance::NotParticipant);
        };

        let marker = |p: &ParticipantEntity, id: i64| ReadMarker {
            conversation_id,
            user_id: *user_id,
            last_read_message_id: id,
            read_at: p.read_at.unwrap_or(p.joined_at),
        };

        match participant.last_read_message_id {
            Some(current) if current == message_id => {
                Ok(ReadAdvance::Unchanged(marker(participant, current)))
            }
            Some(current) if current > message_id => Ok(ReadAdvance::Regressed { current }),
            _ => {
                participant.last_read_message_id = Some(message_id);
                participant.read_at = Some(Utc::now());
                Ok(ReadAdvance::Advanced(marker(participant, message_id)))
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageRepository for MemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<MessageEntity>, error::SystemError> {
        Ok(lock(&self.state).messages.get(&id).cloned())
    }

    async fn create(&self, message: &InsertMessage) -> Result<MessageEntity, error::SystemError> {
        let mut state = lock(&self.state);
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(error::SystemError::not_found("Referenced resource not found"));
        }

        state.last_message_id += 1;
        let now = Utc::now();
        let entity = MessageEntity {
            id: state.last_message_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body.clone(),
            attachments: if message.attachments.is_empty() {
                None
            } else {
                Some(sqlx::types::Json(message.attachments.clone()))
            },
            reply_to_id: message.reply_to_id,
            edited: false,
            edited_at: None,
            deleted: false,
            deleted_at: None,
            created_at: now,
        };
        state.messages.insert(entity.id, entity.clone());
        if let Some((conversation, _)) = state.conversations.get_mut(&message.conversation_id) {
            conversation.updated_at = now;
        }
        Ok(entity)
    }

    async fn update_body(
        &self,
        id: i64,
        sender_id: &Uuid,
        body: &str,
    ) -> Result<Option<MessageEntity>, error::SystemError> {
        let mut state = lock(&self.state);
        Ok(state
            .messages
            .get_mut(&id)
            .filter(|m| m.sender_id == *sender_id && !m.deleted)
            .map(|m| {
                m.body = Some(body.to_string());
                m.edited = true;
                m.edited_at = Some(Utc::now());
                m.clone()
            }))
    }

    async fn soft_delete(&self, id: i64) -> Result<Option<MessageEntity>, error::SystemError> {
        let mut state = lock(&self.state);
        Ok(state.messages.get_mut(&id).filter(|m| !m.deleted).map(|m| {
            m.deleted = true;
            m.deleted_at = Some(Utc::now());
            m.body = None;
            m.attachments = None;
            m.clone()
        }))
    }

    async fn upsert_reaction(
        &self,
        message_id: i64,
        user_id: &Uuid,
        reaction_type: &str,
    ) -> Result<ReactionEntity, error::SystemError> {
        let mut state = lock(&self.state);
        state.reactions.retain(|r| !(r.message_id == message_id && r.user_id == *user_id));
        let reaction = ReactionEntity {
            message_id,
            user_id: *user_id,
            reaction_type: reaction_type.to_string(),
            created_at: Utc::now(),
        };
        state.reactions.push(reaction.clone());
        Ok(reaction)
    }

    async fn delete_reaction(
        &self,
        message_id: i64,
        user_id: &Uuid,
    ) -> Result<bool, error::SystemError> {
        let mut state = lock(&self.state);
        let before = state.reactions.len();
        state.reactions.retain(|r| !(r.message_id == message_id && r.user_id == *user_id));
        Ok(state.reactions.len() < before)
    }

    async fn find_page(
        &self,
        conversation_id: i64,
        page: &MessagePage,
    ) -> Result<Vec<MessageEntity>, error::SystemError> {
        let state = lock(&self.state);
        Ok(state
            .messages
            .values()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| page.before_id.is_none_or(|before| m.id < before))
            .filter(|m| page.after_id.is_none_or(|after| m.id > after))
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn find_reactions(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<ReactionEntity>, error::SystemError> {
        let state = lock(&self.state);
        Ok(state.reactions.iter().filter(|r| message_ids.contains(&r.message_id)).cloned().collect())
    }

    async fn search(
        &self,
        user_id: &Uuid,
        text: &str,
        conversation_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageEntity>, error::SystemError> {
        let state = lock(&self.state);
        let needle = text.to_lowercase();
        Ok(state
            .messages
            .values()
            .rev()
            .filter(|m| !m.deleted && state.is_member(m.conversation_id, user_id))
            .filter(|m| conversation_id.is_none_or(|id| m.conversation_id == id))
            .filter(|m| m.body.as_deref().is_some_and(|b| b.to_lowercase().contains(&needle)))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/* --------------------------------- fixture -------------------------------- */

/// Services wired over one `MemoryStore` and a recording broadcaster.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub users: UserService,
    pub conversations: ConversationService,
    pub messages: MessageService,
    pub presence: PresenceService,
    pub limiter: RateLimitService,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_cache(CacheService::disabled())
    }

    pub fn with_cache(cache: CacheService) -> Self {
        let store = Arc::new(MemoryStore::default());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let ttl = |secs| Ttl::new(secs).unwrap_or(Ttl::MIN);

        let users = UserService::with_dependencies(store.clone(), cache.clone(), ttl(3600));
        let conversations = ConversationService::with_dependencies(
            store.clone(),
            store.clone(),
            users.clone(),
            cache,
            broadcaster.clone(),
            ttl(300),
        );
        let messages =
            MessageService::with_dependencies(store.clone(), conversations.clone(), broadcaster.clone());
        let presence = PresenceService::with_dependencies(
            Arc::new(MemoryPresenceStore::new()),
            broadcaster.clone(),
            Duration::from_secs(90),
        );
        let limiter = RateLimitService::with_dependencies(
            Arc::new(MemoryRateLimiter::new()),
            Default::default(),
        );

        Fixture { store, broadcaster, users, conversations, messages, presence, limiter }
    }

    /// A user known to the identity service and mirrored locally.
    pub async fn user(&self, name: &str) -> Identity {
        let identity = identity(name);
        self.users.sync_identity(&identity).await.unwrap();
        identity
    }

    pub async fn send(&self, sender: &Identity, conversation_id: i64, body: &str) -> MessageView {
        let draft = NewMessage { body: Some(body.to_string()), ..Default::default() };
        self.messages.send(sender, None, conversation_id, draft).await.unwrap()
    }
}
