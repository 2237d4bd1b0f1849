use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};
use uuid::Uuid;

use crate::{
    api::error,
    modules::presence::{model::Departure, repository::PresenceStore},
};

struct Entry {
    handles: HashSet<Uuid>,
    last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    online: HashMap<Uuid, Entry>,
    last_seen: HashMap<Uuid, DateTime<Utc>>,
}

/// Single-instance presence used when Redis is not configured.
#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<State>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn add_connection(
        &self,
        user_id: &Uuid,
        handle: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, error::SystemError> {
        let mut state = self.lock();
        let entry = state
            .online
            .entry(*user_id)
            .or_insert_with(|| Entry { handles: HashSet::new(), last_heartbeat: now });

        let first = entry.handles.is_empty();
        entry.handles.insert(*handle);
        entry.last_heartbeat = now;
        Ok(first)
    }

    async fn remove_connection(
        &self,
        user_id: &Uuid,
        handle: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Departure, error::SystemError> {
        let mut state = self.lock();
        let Some(entry) = state.online.get_mut(user_id) else {
            return Ok(Departure::Unknown);
        };

        if !entry.handles.remove(handle) {
            return Ok(Departure::Unknown);
        }
        if !entry.handles.is_empty() {
            return Ok(Departure::StillOnline);
        }

        state.online.remove(user_id);
        state.last_seen.insert(*user_id, now);
        Ok(Departure::WentOffline { at: now })
    }

    async fn touch(&self, user_id: &Uuid, now: DateTime<Utc>) -> Result<bool, error::SystemError> {
        let mut state = self.lock();
        match state.online.get_mut(user_id) {
            Some(entry) => {
                entry.last_heartbeat = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn online(&self, user_ids: &[Uuid]) -> Result<Vec<bool>, error::SystemError> {
        let state = self.lock();
        Ok(user_ids.iter().map(|id| state.online.contains_key(id)).collect())
    }

    async fn last_seen(
        &self,
        user_ids: &[Uuid],
    ) -> Result<Vec<Option<DateTime<Utc>>>, error::SystemError> {
        let state = self.lock();
        Ok(user_ids.iter().map(|id| state.last_seen.get(id).copied()).collect())
    }

    async fn expire_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, error::SystemError> {
        let mut state = self.lock();
        let stale: Vec<Uuid> = state
            .online
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat <= cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            state.online.remove(id);
            state.last_seen.insert(*id, now);
        }
        Ok(stale)
    }
}
