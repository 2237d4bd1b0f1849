/// WebSocket HTTP Handler
///
/// Upgrades `GET /ws` and runs the transport loop for one connection:
/// - Inbound:  Client -> WebSocket -> parse_frame -> ChatSession
/// - Outbound: ChatHub -> ChatSession -> mpsc channel -> WebSocket -> Client
use actix::{Actor, Addr};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    api::error,
    modules::{
        rate_limit::service::{ActionClass, RateLimitService},
        user::{identity::IdentityProvider, service::UserService},
        websocket::{
            dispatch::Dispatcher,
            message::parse_frame,
            server::ChatHub,
            session::{ChatSession, Inbound, Malformed, Outbound, SessionSettings, Touch, TransportClosed},
        },
    },
};

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Credential presented with the upgrade request, header first.
fn upgrade_credential(req: &HttpRequest) -> Option<String> {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    header.or_else(|| {
        web::Query::<TokenQuery>::from_query(req.query_string())
            .ok()
            .and_then(|q| q.into_inner().token)
            .filter(|t| !t.trim().is_empty())
    })
}

fn peer_ip(req: &HttpRequest) -> String {
    req.peer_addr().map(|addr| addr.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

#[allow(clippy::too_many_arguments)]
pub async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    hub: web::Data<Addr<ChatHub>>,
    dispatcher: web::Data<Dispatcher>,
    users: web::Data<UserService>,
    identities: web::Data<dyn IdentityProvider>,
    limiter: web::Data<RateLimitService>,
    settings: web::Data<SessionSettings>,
) -> Result<HttpResponse, actix_web::Error> {
    let ip = peer_ip(&req);
    tracing::debug!("WebSocket upgrade request from {ip}");

    limiter.check(ActionClass::Auth, &ip).await.map_err(error::Error::from)?;

    let upgrade_identity = match upgrade_credential(&req) {
        Some(credential) => {
            Some(identities.verify(&credential).map_err(error::Error::from)?)
        }
        None => None,
    };

    let (response, mut ws_session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let addr = ChatSession::new(
        upgrade_identity,
        hub.get_ref().clone(),
        dispatcher.get_ref().clone(),
        users.get_ref().clone(),
        identities.clone().into_inner(),
        *settings.get_ref(),
        tx,
    )
    .start();

    actix_web::rt::spawn(async move {
        let mut close_reason = None;

        loop {
            tokio::select! {
                msg = msg_stream.recv() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                            Ok((reference, event)) => addr.do_send(Inbound { reference, event }),
                            Err(e) => {
                                tracing::debug!("Malformed frame: {}", e.reason);
                                addr.do_send(Malformed(e));
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            addr.do_send(Touch);
                            if let Err(e) = ws_session.pong(&data).await {
                                tracing::error!("Cannot send pong: {e}");
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => addr.do_send(Touch),
                        Some(Ok(Message::Close(reason))) => {
                            tracing::info!("Client closed the connection: {reason:?}");
                            break;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            tracing::warn!("Binary frames are not supported");
                            addr.do_send(Touch);
                        }
                        Some(Ok(Message::Continuation(_) | Message::Nop)) => {}
                        Some(Err(e)) => {
                            tracing::error!("WebSocket protocol error: {e}");
                            break;
                        }
                        None => break,
                    }
                }

                outbound = rx.recv() => {
                    match outbound {
                        Some(Outbound::Text(text)) => {
                            if ws_session.text(text).await.is_err() {
                                tracing::debug!("Client went away mid-send");
                                break;
                            }
                        }
                        Some(Outbound::Close(reason)) => {
                            close_reason = reason;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        addr.do_send(TransportClosed);
        let _ = ws_session.close(close_reason).await;
        tracing::debug!("WebSocket transport loop finished");
    });

    Ok(response)
}
