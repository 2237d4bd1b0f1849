/// Messages exchanged between session actors and the hub.
use actix::prelude::*;
use uuid::Uuid;

use super::broadcaster::Room;
use super::message::ServerMessage;

/// An event the hub pushes into one session.
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct Deliver(pub ServerMessage);

/// Session became `Active`: register it with its initial rooms.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub recipient: Recipient<Deliver>,
    pub rooms: Vec<Room>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub connection_id: Uuid,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct JoinRoom {
    pub connection_id: Uuid,
    pub room: Room,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct LeaveRoom {
    pub connection_id: Uuid,
    pub room: Room,
}

/// Connection ids currently in a room.
#[derive(Message)]
#[rtype(result = "Vec<Uuid>")]
pub struct RoomMembers(pub Room);

#[derive(Message)]
#[rtype(result = "usize")]
pub struct ConnectionCount;
