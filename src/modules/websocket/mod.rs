/// WebSocket Module
///
/// Real-time gateway of the chat service:
///
/// - Frame protocol (`ClientMessage` and `ServerMessage`)
/// - Hub actor owning room membership on this instance
/// - Session actor per connection (auth, heartbeat, dispatch)
/// - Broadcaster carrying room events across instances
/// - HTTP handler upgrading `GET /ws`
pub mod broadcaster;
pub mod dispatch;
pub mod events;
pub mod handler;
pub mod message;
pub mod server;
pub mod session;
