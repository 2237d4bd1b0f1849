/// WebSocket Session Actor
///
/// One actor per connection. It owns the connection state machine
/// (`Authenticating -> Active -> Closed`), runs the heartbeat and pushes
/// outbound frames to the transport task in `handler.rs` through a channel.
use actix::prelude::*;
use actix_ws::{CloseCode, CloseReason};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    api::error,
    constants::Env,
    modules::{
        user::{
            identity::{Identity, IdentityProvider},
            service::UserService,
        },
        websocket::{
            broadcaster::Room,
            dispatch::{Dispatcher, RoomChange, SessionDescriptor},
            events::*,
            message::{encode_frame, ClientMessage, FrameError, ServerMessage},
            server::ChatHub,
        },
    },
};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub presence_ttl: Duration,
    pub auth_timeout: Duration,
}

impl From<&Env> for SessionSettings {
    fn from(env: &Env) -> Self {
        Self {
            heartbeat_interval: env.heartbeat_interval,
            presence_ttl: env.presence_ttl,
            auth_timeout: env.auth_timeout,
        }
    }
}

/// Frames for the transport task.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close(Option<CloseReason>),
}

#[derive(Debug)]
enum SessionState {
    Authenticating,
    /// Credential accepted, joining rooms and registering presence.
    Activating,
    Active(SessionDescriptor),
    Closed,
}

/// A parsed text frame.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Inbound {
    pub reference: Option<String>,
    pub event: ClientMessage,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Malformed(pub FrameError);

/// Any frame arrived, control frames included.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Touch;

#[derive(Message)]
#[rtype(result = "()")]
pub struct TransportClosed;

pub struct ChatSession {
    state: SessionState,
    /// Verified at upgrade time, activated once the actor starts.
    upgrade_identity: Option<Identity>,
    hub: Addr<ChatHub>,
    dispatcher: Dispatcher,
    users: UserService,
    identities: Arc<dyn IdentityProvider>,
    settings: SessionSettings,
    tx: mpsc::UnboundedSender<Outbound>,
    last_frame: Instant,
}

impl ChatSession {
    pub fn new(
        upgrade_identity: Option<Identity>,
        hub: Addr<ChatHub>,
        dispatcher: Dispatcher,
        users: UserService,
        identities: Arc<dyn IdentityProvider>,
        settings: SessionSettings,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            state: SessionState::Authenticating,
            upgrade_identity,
            hub,
            dispatcher,
            users,
            identities,
            settings,
            tx,
            last_frame: Instant::now(),
        }
    }

    fn send(&self, reference: Option<&str>, message: &ServerMessage) {
        match encode_frame(reference, message) {
            Ok(text) => {
                if self.tx.send(Outbound::Text(text)).is_err() {
                    tracing::debug!("Transport already gone, dropping frame");
                }
            }
            Err(e) => tracing::error!("Cannot encode outbound frame: {e}"),
        }
    }

    fn send_error(&self, reference: Option<&str>, event: Option<&str>, err: &error::SystemError) {
        self.send(reference, &ServerMessage::error(event, err));
    }

    fn close(&mut self, ctx: &mut Context<Self>, code: CloseCode, description: &str) {
        if matches!(ctx.state(), ActorState::Stopping | ActorState::Stopped) {
            return;
        }
        let reason = CloseReason { code, description: Some(description.to_string()) };
        let _ = self.tx.send(Outbound::Close(Some(reason)));
        ctx.stop();
    }

    fn authenticate(&mut self, reference: Option<String>, token: &str, ctx: &mut Context<Self>) {
        match self.identities.verify(token) {
            Ok(identity) => self.activate(identity, reference, ctx),
            Err(e) => {
                tracing::info!("Rejected credential on first frame: {e}");
                self.send_error(reference.as_deref(), Some("auth"), &e);
                self.close(ctx, CloseCode::Policy, "Authentication failed");
            }
        }
    }

    /// Joins rooms and registers presence before any other frame is handled.
    fn activate(&mut self, identity: Identity, reference: Option<String>, ctx: &mut Context<Self>) {
        self.state = SessionState::Activating;

        let descriptor = SessionDescriptor::new(identity);
        let hub = self.hub.clone();
        let users = self.users.clone();
        let conversations = self.dispatcher.conversations().clone();
        let presence = self.dispatcher.presence().clone();
        let recipient = ctx.address().recipient();
        let session = descriptor.clone();

        let activation = async move {
            users.sync_identity(&session.identity).await?;
            let conversation_ids = conversations.conversation_ids_for_user(&session.user_id()).await?;

            hub.send(Connect {
                connection_id: session.connection_id,
                user_id: session.user_id(),
                recipient,
                rooms: conversation_ids.iter().copied().map(Room::Conversation).collect(),
            })
            .await
            .map_err(|e| error::SystemError::backend_unavailable(format!("chat hub: {e}")))?;

            presence.register_connection(session.user_id(), session.connection_id).await?;
            Ok::<_, error::SystemError>(conversation_ids)
        };

        ctx.wait(activation.into_actor(self).map(move |result, act, ctx| match result {
            Ok(conversation_ids) => {
                tracing::info!(
                    "Session {} active for user {}",
                    descriptor.connection_id,
                    descriptor.user_id()
                );
                act.send(
                    reference.as_deref(),
                    &ServerMessage::AuthSuccess { user_id: descriptor.user_id(), conversation_ids },
                );
                act.state = SessionState::Active(descriptor);
            }
            Err(e) => {
                tracing::error!("Session activation failed for {}: {e}", descriptor.user_id());
                act.hub.do_send(Disconnect { connection_id: descriptor.connection_id });
                act.send_error(reference.as_deref(), Some("auth"), &e);
                act.close(ctx, CloseCode::Error, "Session could not be started");
            }
        }));
    }

    /// Events from one connection are handled in arrival order.
    fn dispatch(&mut self, reference: Option<String>, event: ClientMessage, ctx: &mut Context<Self>) {
        let SessionState::Active(descriptor) = &self.state else {
            return;
        };
        let descriptor = descriptor.clone();
        let dispatcher = self.dispatcher.clone();
        let name = event.name();

        let work = async move { dispatcher.dispatch(&descriptor, event).await };

        ctx.wait(work.into_actor(self).map(move |result, act, _ctx| {
            let SessionState::Active(descriptor) = &act.state else {
                return;
            };
            match result {
                Ok(outcome) => {
                    if let Some(change) = outcome.room_change {
                        let connection_id = descriptor.connection_id;
                        match change {
                            RoomChange::Join(room) => act.hub.do_send(JoinRoom { connection_id, room }),
                            RoomChange::Leave(room) => {
                                act.hub.do_send(LeaveRoom { connection_id, room })
                            }
                        }
                    }
                    if let Some(reply) = outcome.reply {
                        act.send(reference.as_deref(), &reply);
                    }
                }
                Err(e) => {
                    tracing::debug!("{name} from {} failed: {e}", descriptor.user_id());
                    act.send_error(reference.as_deref(), Some(name), &e);
                }
            }
        }));
    }

    fn heartbeat(&mut self, ctx: &mut Context<Self>) {
        if self.last_frame.elapsed() > self.settings.presence_ttl {
            tracing::info!("Closing silent connection after {:?}", self.settings.presence_ttl);
            self.close(ctx, CloseCode::Away, "Heartbeat timeout");
            return;
        }

        let SessionState::Active(descriptor) = &self.state else {
            return;
        };
        let presence = self.dispatcher.presence().clone();
        let (user_id, handle) = (descriptor.user_id(), descriptor.connection_id);

        ctx.spawn(
            async move {
                if let Err(e) = presence.heartbeat(user_id, handle).await {
                    tracing::warn!("Presence heartbeat failed for {user_id}: {e}");
                }
            }
            .into_actor(self),
        );
    }
}

impl Actor for ChatSession {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(self.settings.heartbeat_interval, |act, ctx| act.heartbeat(ctx));

        if let Some(identity) = self.upgrade_identity.take() {
            self.activate(identity, None, ctx);
            return;
        }

        ctx.run_later(self.settings.auth_timeout, |act, ctx| {
            if matches!(act.state, SessionState::Authenticating) {
                tracing::info!("No auth frame within {:?}", act.settings.auth_timeout);
                act.send_error(
                    None,
                    None,
                    &error::SystemError::unauthenticated("Authentication timed out"),
                );
                act.close(ctx, CloseCode::Policy, "Authentication timeout");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        let SessionState::Active(descriptor) = state else {
            tracing::debug!("Session closed before authentication");
            return;
        };

        let connection_id = descriptor.connection_id;
        self.hub.do_send(Disconnect { connection_id });

        let presence = self.dispatcher.presence().clone();
        actix::spawn(async move {
            if let Err(e) =
                presence.deregister_connection(descriptor.user_id(), descriptor.connection_id).await
            {
                tracing::warn!("Presence deregistration failed for {}: {e}", descriptor.user_id());
            }
        });
        tracing::info!("Session {connection_id} closed");
    }
}

impl Handler<Inbound> for ChatSession {
    type Result = ();

    fn handle(&mut self, msg: Inbound, ctx: &mut Context<Self>) {
        self.last_frame = Instant::now();

        let authenticating = matches!(self.state, SessionState::Authenticating);
        let active = matches!(self.state, SessionState::Active(_));

        match msg.event {
            ClientMessage::Auth { token } if authenticating => {
                self.authenticate(msg.reference, &token, ctx)
            }
            event if authenticating => {
                let err = error::SystemError::unauthenticated("Authenticate first");
                self.send_error(msg.reference.as_deref(), Some(event.name()), &err);
                self.close(ctx, CloseCode::Policy, "Authentication required");
            }
            event if active => self.dispatch(msg.reference, event, ctx),
            _ => {}
        }
    }
}

impl Handler<Malformed> for ChatSession {
    type Result = ();

    fn handle(&mut self, msg: Malformed, ctx: &mut Context<Self>) {
        self.last_frame = Instant::now();
        let FrameError { reference, event, reason } = msg.0;
        let err = error::SystemError::validation(reason);

        if matches!(self.state, SessionState::Authenticating) {
            self.send_error(reference.as_deref(), event.as_deref(), &err);
            self.close(ctx, CloseCode::Policy, "Authentication required");
            return;
        }
        self.send_error(reference.as_deref(), event.as_deref(), &err);
    }
}

impl Handler<Touch> for ChatSession {
    type Result = ();

    fn handle(&mut self, _: Touch, _: &mut Context<Self>) {
        self.last_frame = Instant::now();
    }
}

impl Handler<TransportClosed> for ChatSession {
    type Result = ();

    fn handle(&mut self, _: TransportClosed, ctx: &mut Context<Self>) {
        ctx.stop();
    }
}

impl Handler<Deliver> for ChatSession {
    type Result = ();

    fn handle(&mut self, msg: Deliver, _: &mut Context<Self>) {
        if matches!(self.state, SessionState::Active(_)) {
            self.send(None, &msg.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        modules::websocket::{broadcaster::Envelope, broadcaster::BusMessage, message::parse_frame},
        test::{identity, Fixture},
    };
    use serde_json::Value;
    use std::collections::HashMap;

    /// Accepts exactly the tokens it was built with.
    struct StaticIdentities(HashMap<String, Identity>);

    impl IdentityProvider for StaticIdentities {
        fn verify(&self, credential: &str) -> Result<Identity, error::SystemError> {
            self.0
                .get(credential)
                .cloned()
                .ok_or_else(|| error::SystemError::unauthenticated("Token Invalid or Expired"))
        }
    }

    struct Harness {
        fx: Fixture,
        hub: Addr<ChatHub>,
        identities: Arc<StaticIdentities>,
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_millis(20),
            presence_ttl: Duration::from_secs(90),
            auth_timeout: Duration::from_millis(60),
        }
    }

    impl Harness {
        fn new(tokens: Vec<(&str, Identity)>) -> Self {
            let identities = tokens.into_iter().map(|(t, i)| (t.to_string(), i)).collect();
            Harness {
                fx: Fixture::new(),
                hub: ChatHub::new().start(),
                identities: Arc::new(StaticIdentities(identities)),
            }
        }

        fn start(
            &self,
            upgrade_identity: Option<Identity>,
            settings: SessionSettings,
        ) -> (Addr<ChatSession>, mpsc::UnboundedReceiver<Outbound>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let dispatcher = Dispatcher::with_dependencies(
                self.fx.messages.clone(),
                self.fx.conversations.clone(),
                self.fx.presence.clone(),
                self.fx.limiter.clone(),
                self.fx.broadcaster.clone(),
            );
            let session = ChatSession::new(
                upgrade_identity,
                self.hub.clone(),
                dispatcher,
                self.fx.users.clone(),
                self.identities.clone(),
                settings,
                tx,
            );
            (session.start(), rx)
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        match rx.recv().await {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    fn inbound(text: &str) -> Inbound {
        let (reference, event) = parse_frame(text).unwrap();
        Inbound { reference, event }
    }

    #[actix_web::test]
    async fn test_auth_frame_activates_and_joins_rooms() {
        let ana = identity("Ana");
        let harness = Harness::new(vec![("good", ana.clone())]);
        let bao = harness.fx.user("Bao").await;
        harness.fx.users.sync_identity(&ana).await.unwrap();
        let direct = harness.fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();

        let (session, mut rx) = harness.start(None, settings());
        session.do_send(inbound(r#"{"event":"auth","ref":"a1","data":{"token":"good"}}"#));

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["event"], "auth:success");
        assert_eq!(frame["ref"], "a1");
        assert_eq!(frame["data"]["conversationIds"], serde_json::json!([direct.id]));

        assert_eq!(harness.hub.send(RoomMembers(Room::Conversation(direct.id))).await.unwrap().len(), 1);
        assert!(harness.fx.presence.is_online(ana.user_id).await.unwrap());

        session.do_send(inbound(r#"{"event":"ping","ref":"p"}"#));
        let pong = next_frame(&mut rx).await;
        assert_eq!(pong["event"], "pong");
        assert_eq!(pong["ref"], "p");
    }

    #[actix_web::test]
    async fn test_event_before_auth_closes_with_policy_violation() {
        let harness = Harness::new(vec![]);
        let (session, mut rx) = harness.start(None, settings());

        session.do_send(inbound(r#"{"event":"typing:start","data":{"conversationId":1}}"#));

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["data"]["code"], "AuthenticationFailed");
        match rx.recv().await {
            Some(Outbound::Close(Some(reason))) => assert_eq!(reason.code, CloseCode::Policy),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[actix_web::test]
    async fn test_bad_token_and_timeout_close() {
        let harness = Harness::new(vec![]);

        let (session, mut rx) = harness.start(None, settings());
        session.do_send(inbound(r#"{"event":"auth","data":{"token":"forged"}}"#));
        assert_eq!(next_frame(&mut rx).await["data"]["code"], "AuthenticationFailed");
        assert!(matches!(rx.recv().await, Some(Outbound::Close(_))));

        let (_silent, mut rx) = harness.start(None, settings());
        assert_eq!(next_frame(&mut rx).await["data"]["code"], "AuthenticationFailed");
        match rx.recv().await {
            Some(Outbound::Close(Some(reason))) => {
                assert_eq!(reason.description.as_deref(), Some("Authentication timeout"))
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[actix_web::test]
    async fn test_upgrade_identity_receives_room_broadcasts_and_cleans_up() {
        let harness = Harness::new(vec![]);
        let ana = harness.fx.user("Ana").await;
        let bao = harness.fx.user("Bao").await;
        let direct = harness.fx.conversations.create_direct(&ana, bao.user_id).await.unwrap();

        let (session, mut rx) = harness.start(Some(bao.clone()), settings());
        assert_eq!(next_frame(&mut rx).await["event"], "auth:success");

        harness.hub.do_send(BusMessage::Deliver(Envelope::to_conversation(
            direct.id,
            ServerMessage::UserOnline { user_id: ana.user_id },
        )));
        assert_eq!(next_frame(&mut rx).await["event"], "user:online");

        session.do_send(TransportClosed);
        actix::clock::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.hub.send(ConnectionCount).await.unwrap(), 0);
        assert!(!harness.fx.presence.is_online(bao.user_id).await.unwrap());
    }

    #[actix_web::test]
    async fn test_failures_go_to_the_sender_with_ref() {
        let harness = Harness::new(vec![]);
        let ana = harness.fx.user("Ana").await;

        let (session, mut rx) = harness.start(Some(ana), settings());
        next_frame(&mut rx).await;

        session.do_send(inbound(
            r#"{"event":"message:send","ref":"s1","data":{"conversationId":999,"body":"hi"}}"#,
        ));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["ref"], "s1");
        assert_eq!(frame["data"]["event"], "message:send");
        assert_eq!(frame["data"]["code"], "NotFound");

        let malformed = parse_frame(r#"{"event":"message:edit","ref":"e1","data":{}}"#).unwrap_err();
        session.do_send(Malformed(malformed));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["ref"], "e1");
        assert_eq!(frame["data"]["code"], "ValidationError");
    }

    #[actix_web::test]
    async fn test_silent_connection_is_closed_as_zombie() {
        let harness = Harness::new(vec![]);
        let ana = harness.fx.user("Ana").await;
        let zombie = SessionSettings { presence_ttl: Duration::from_millis(40), ..settings() };

        let (_session, mut rx) = harness.start(Some(ana), zombie);
        assert_eq!(next_frame(&mut rx).await["event"], "auth:success");
        match rx.recv().await {
            Some(Outbound::Close(Some(reason))) => assert_eq!(reason.code, CloseCode::Away),
            other => panic!("expected close, got {other:?}"),
        }
    }
}
