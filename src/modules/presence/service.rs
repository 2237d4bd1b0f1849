use chrono::{DateTime, Utc};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    api::error,
    modules::{
        presence::{
            model::{Departure, PresenceInfo},
            repository::PresenceStore,
        },
        websocket::{
            broadcaster::{Broadcaster, BusMessage, Envelope},
            message::ServerMessage,
        },
    },
};

/// Presence changes that could not be published yet.
const MAX_PENDING_EVENTS: usize = 1024;

/// Tracks which users hold at least one live connection and announces the
/// online/offline transitions to every connected session.
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    broadcaster: Arc<dyn Broadcaster>,
    ttl: Duration,
    pending: Arc<Mutex<VecDeque<ServerMessage>>>,
}

impl PresenceService {
    pub fn with_dependencies(
        store: Arc<dyn PresenceStore>,
        broadcaster: Arc<dyn Broadcaster>,
        ttl: Duration,
    ) -> Self {
        Self { store, broadcaster, ttl, pending: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub async fn register_connection(
        &self,
        user_id: Uuid,
        handle: Uuid,
    ) -> Result<(), error::SystemError> {
        let first = self.store.add_connection(&user_id, &handle, Utc::now()).await?;
        if first {
            log::info!("User {user_id} is online");
            self.announce(ServerMessage::UserOnline { user_id }).await;
        }
        Ok(())
    }

    pub async fn deregister_connection(
        &self,
        user_id: Uuid,
        handle: Uuid,
    ) -> Result<(), error::SystemError> {
        match self.store.remove_connection(&user_id, &handle, Utc::now()).await? {
            Departure::WentOffline { at } => {
                log::info!("User {user_id} is offline");
                self.announce(ServerMessage::UserOffline { user_id, last_seen: at }).await;
            }
            Departure::StillOnline => {}
            Departure::Unknown => {
                log::debug!("Connection {handle} of user {user_id} was already gone");
            }
        }
        Ok(())
    }

    /// Refreshes liveness. A user the sweeper already expired is registered
    /// again so a slow but alive connection comes back online.
    pub async fn heartbeat(&self, user_id: Uuid, handle: Uuid) -> Result<(), error::SystemError> {
        if !self.store.touch(&user_id, Utc::now()).await? {
            log::debug!("Heartbeat for expired user {user_id}, registering again");
            self.register_connection(user_id, handle).await?;
        }
        Ok(())
    }

    pub async fn is_online(&self, user_id: Uuid) -> Result<bool, error::SystemError> {
        let flags = self.store.online(&[user_id]).await?;
        Ok(flags.first().copied().unwrap_or(false))
    }

    pub async fn online_status_batch(
        &self,
        user_ids: &[Uuid],
    ) -> Result<Vec<PresenceInfo>, error::SystemError> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }

        let online = self.store.online(user_ids).await?;
        let last_seen = self.store.last_seen(user_ids).await?;

        Ok(user_ids
            .iter()
            .zip(online)
            .zip(last_seen)
            .map(|((user_id, is_online), last_seen)| PresenceInfo {
                user_id: *user_id,
                is_online,
                last_seen: if is_online { None } else { last_seen },
            })
            .collect())
    }

    /// Expires users without a heartbeat for a full TTL and retries any
    /// presence events that failed to publish earlier.
    pub async fn sweep(&self) -> Result<usize, error::SystemError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, error::SystemError> {
        self.flush_pending().await;

        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let expired = self.store.expire_stale(now - ttl, now).await?;

        for user_id in &expired {
            log::info!("User {user_id} missed heartbeats, marking offline");
            self.announce(ServerMessage::UserOffline { user_id: *user_id, last_seen: now }).await;
        }
        Ok(expired.len())
    }

    pub fn spawn_sweeper(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    log::warn!("Presence sweep failed: {e}");
                }
            }
        })
    }

    pub fn pending_events(&self) -> usize {
        self.pending.lock().map(|q| q.len()).unwrap_or(0)
    }

    async fn announce(&self, event: ServerMessage) {
        let bus = BusMessage::Deliver(Envelope::to_everyone(event.clone()));
        if let Err(e) = self.broadcaster.publish(bus).await {
            log::warn!("Presence event not published, queued for retry: {e}");
            self.enqueue(event);
        }
    }

    fn enqueue(&self, event: ServerMessage) {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending.len() >= MAX_PENDING_EVENTS {
            pending.pop_front();
        }
        pending.push_back(event);
    }

    async fn flush_pending(&self) {
        let drained: Vec<ServerMessage> = {
            let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.drain(..).collect()
        };

        for event in drained {
            let bus = BusMessage::Deliver(Envelope::to_everyone(event.clone()));
            if self.broadcaster.publish(bus).await.is_err() {
                self.enqueue(event);
            }
        }
    }
}
