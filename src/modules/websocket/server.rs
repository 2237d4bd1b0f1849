/// Chat hub actor
///
/// Owns the room membership of every session on this instance and routes
/// envelopes to the sessions of a room. It performs only mailbox sends, so a
/// slow session never stalls routing for the others.
use actix::prelude::*;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::broadcaster::{BusMessage, Envelope, Room};
use super::events::*;

struct SessionEntry {
    user_id: Uuid,
    recipient: Recipient<Deliver>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
pub struct ChatHub {
    /// connection id -> session
    sessions: HashMap<Uuid, SessionEntry>,
    /// user id -> connection ids, one per device
    users: HashMap<Uuid, HashSet<Uuid>>,
    /// room -> connection ids
    rooms: HashMap<Room, HashSet<Uuid>>,
}

impl ChatHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(&mut self, connection_id: Uuid, room: Room) {
        let Some(entry) = self.sessions.get_mut(&connection_id) else {
            return;
        };
        entry.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(connection_id);
    }

    fn leave(&mut self, connection_id: Uuid, room: Room) {
        if let Some(entry) = self.sessions.get_mut(&connection_id) {
            entry.rooms.remove(&room);
        }
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
    }

    fn connections_of(&self, user_id: &Uuid) -> Vec<Uuid> {
        self.users.get(user_id).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
    }

    fn deliver(&self, envelope: Envelope) {
        let targets: Vec<&Uuid> = match &envelope.room {
            Some(room) => match self.rooms.get(room) {
                Some(members) => members.iter().collect(),
                None => {
                    tracing::trace!("No local members in {room:?}");
                    return;
                }
            },
            None => self.sessions.keys().collect(),
        };

        let mut sent = 0;
        for connection_id in targets {
            let Some(entry) = self.sessions.get(connection_id) else {
                continue;
            };
            if envelope.excludes(connection_id, &entry.user_id) {
                continue;
            }
            entry.recipient.do_send(Deliver(envelope.event.clone()));
            sent += 1;
        }

        tracing::debug!("Delivered to {sent} sessions in {:?}", envelope.room);
    }
}

impl Actor for ChatHub {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("Chat hub started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("Chat hub stopped");
    }
}

impl Handler<Connect> for ChatHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) {
        self.sessions.insert(
            msg.connection_id,
            SessionEntry { user_id: msg.user_id, recipient: msg.recipient, rooms: HashSet::new() },
        );
        let devices = self.users.entry(msg.user_id).or_default();
        devices.insert(msg.connection_id);

        tracing::info!(
            "User {} connected on {} ({} active sessions)",
            msg.user_id,
            msg.connection_id,
            devices.len()
        );

        self.join(msg.connection_id, Room::User(msg.user_id));
        for room in msg.rooms {
            self.join(msg.connection_id, room);
        }
    }
}

impl Handler<Disconnect> for ChatHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) {
        let Some(entry) = self.sessions.remove(&msg.connection_id) else {
            return;
        };

        for room in &entry.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&msg.connection_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }

        if let Some(devices) = self.users.get_mut(&entry.user_id) {
            devices.remove(&msg.connection_id);
            if devices.is_empty() {
                self.users.remove(&entry.user_id);
            }
        }

        tracing::debug!(
            "Session {} of user {} left {} rooms",
            msg.connection_id,
            entry.user_id,
            entry.rooms.len()
        );
    }
}

impl Handler<JoinRoom> for ChatHub {
    type Result = ();

    fn handle(&mut self, msg: JoinRoom, _: &mut Context<Self>) {
        self.join(msg.connection_id, msg.room);
    }
}

impl Handler<LeaveRoom> for ChatHub {
    type Result = ();

    fn handle(&mut self, msg: LeaveRoom, _: &mut Context<Self>) {
        self.leave(msg.connection_id, msg.room);
    }
}

impl Handler<BusMessage> for ChatHub {
    type Result = ();

    fn handle(&mut self, msg: BusMessage, _: &mut Context<Self>) {
        match msg {
            BusMessage::Deliver(envelope) => self.deliver(envelope),
            BusMessage::Join { user_id, conversation_id } => {
                for connection_id in self.connections_of(&user_id) {
                    self.join(connection_id, Room::Conversation(conversation_id));
                }
            }
            BusMessage::Leave { user_id, conversation_id } => {
                for connection_id in self.connections_of(&user_id) {
                    self.leave(connection_id, Room::Conversation(conversation_id));
                }
            }
        }
    }
}

impl Handler<RoomMembers> for ChatHub {
    type Result = Vec<Uuid>;

    fn handle(&mut self, msg: RoomMembers, _: &mut Context<Self>) -> Self::Result {
        self.rooms.get(&msg.0).map(|m| m.iter().copied().collect()).unwrap_or_default()
    }
}

impl Handler<ConnectionCount> for ChatHub {
    type Result = usize;

    fn handle(&mut self, _: ConnectionCount, _: &mut Context<Self>) -> Self::Result {
        self.sessions.len()
    }
}
