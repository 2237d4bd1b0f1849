/// Fan-out of server events to connected sessions.
///
/// Services never talk to sessions directly: they hand a `BusMessage` to a
/// `Broadcaster`. The local implementation feeds this process's hub; the
/// Redis implementation publishes on a channel every instance subscribes to,
/// and each instance's listener feeds its own hub.
use actix::prelude::*;
use deadpool_redis::redis::{self, AsyncCommands};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::{api::error, modules::websocket::message::ServerMessage};

pub const FANOUT_CHANNEL: &str = "chat:fanout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Room {
    /// Private room holding every connection of one user.
    User(Uuid),
    Conversation(i64),
}

/// An event addressed to a room (or to everyone) with optional exclusions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// `None` delivers to every session.
    pub room: Option<Room>,
    pub event: ServerMessage,
    pub skip_connection: Option<Uuid>,
    pub skip_user: Option<Uuid>,
}

impl Envelope {
    pub fn to_room(room: Room, event: ServerMessage) -> Self {
        Self { room: Some(room), event, skip_connection: None, skip_user: None }
    }

    pub fn to_conversation(conversation_id: i64, event: ServerMessage) -> Self {
        Self::to_room(Room::Conversation(conversation_id), event)
    }

    pub fn to_user(user_id: Uuid, event: ServerMessage) -> Self {
        Self::to_room(Room::User(user_id), event)
    }

    pub fn to_everyone(event: ServerMessage) -> Self {
        Self { room: None, event, skip_connection: None, skip_user: None }
    }

    pub fn skip_connection(mut self, connection_id: Option<Uuid>) -> Self {
        self.skip_connection = connection_id;
        self
    }

    pub fn skip_user(mut self, user_id: Uuid) -> Self {
        self.skip_user = Some(user_id);
        self
    }

    pub fn excludes(&self, connection_id: &Uuid, user_id: &Uuid) -> bool {
        self.skip_connection.as_ref() == Some(connection_id) || self.skip_user.as_ref() == Some(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
#[rtype(result = "()")]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BusMessage {
    Deliver(Envelope),
    /// Adds every connection of the user to the conversation room.
    #[serde(rename_all = "camelCase")]
    Join { user_id: Uuid, conversation_id: i64 },
    /// Removes every connection of the user from the conversation room.
    #[serde(rename_all = "camelCase")]
    Leave { user_id: Uuid, conversation_id: i64 },
}

#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), error::SystemError>;
}

/// Publishes after a committed write. The write stands even if fan-out
/// fails; clients reconcile from history.
pub async fn publish_or_log(broadcaster: &dyn Broadcaster, message: BusMessage) {
    if let Err(e) = broadcaster.publish(message).await {
        log::error!("Fan-out failed after a committed write: {e}");
    }
}

/// In-process delivery straight into the hub.
pub struct LocalBroadcaster {
    hub: Recipient<BusMessage>,
}

impl LocalBroadcaster {
    pub fn new(hub: Recipient<BusMessage>) -> Self {
        Self { hub }
    }
}

#[async_trait::async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn publish(&self, message: BusMessage) -> Result<(), error::SystemError> {
        self.hub.do_send(message);
        Ok(())
    }
}

/// Cross-instance delivery through Redis pub/sub.
pub struct RedisBroadcaster {
    pool: deadpool_redis::Pool,
    channel: String,
}

impl RedisBroadcaster {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool, channel: FANOUT_CHANNEL.to_string() }
    }
}

#[async_trait::async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn publish(&self, message: BusMessage) -> Result<(), error::SystemError> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.pool.get().await?;
        let receivers: u64 = conn.publish(&self.channel, payload).await?;
        log::trace!("Published to {} ({receivers} subscribers)", self.channel);
        Ok(())
    }
}

/// Subscribes to the fan-out channel and feeds every message into the local
/// hub. Reconnects with capped backoff until the task is aborted.
pub async fn run_bus_listener(redis_url: String, hub: Recipient<BusMessage>) {
    let mut backoff = Duration::from_millis(500);

    loop {
        match listen_once(&redis_url, &hub).await {
            Ok(()) => {
                tracing::warn!("Fan-out subscription ended, resubscribing");
                backoff = Duration::from_millis(500);
            }
            Err(e) => {
                tracing::error!("Fan-out subscription failed: {e}, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}

async fn listen_once(
    redis_url: &str,
    hub: &Recipient<BusMessage>,
) -> Result<(), error::SystemError> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(FANOUT_CHANNEL).await?;
    tracing::info!("Subscribed to {FANOUT_CHANNEL}");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Unreadable fan-out payload: {e}");
                continue;
            }
        };

        match serde_json::from_str::<BusMessage>(&payload) {
            Ok(message) => hub.do_send(message),
            Err(e) => tracing::warn!("Dropping malformed fan-out message: {e}"),
        }
    }

    Ok(())
}
