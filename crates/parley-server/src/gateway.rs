//! WebSocket gateway.
//!
//! The credential is checked before the upgrade, so a refused client gets
//! a plain HTTP error and never touches the registry. After the upgrade one
//! task drains the connection's outbound queue into the socket while the
//! handler reads client events and dispatches them to [`Realtime`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_shared::protocol::{ClientEvent, SendError, ServerEvent, SignalRequest};
use parley_shared::types::UserId;
use parley_store::User;

use crate::api::AppState;
use crate::auth::extract_credential;
use crate::error::ServerError;
use crate::fanout::FanoutEngine;
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound, OutboundRx};
use crate::signaling::{SignalKind, SignalingRelay};

/// WebSocket close code sent when the server ends a session.
const CLOSE_POLICY: u16 = 1008;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ServerError> {
    let credential = extract_credential(&headers, &uri);
    let user = match state.authenticator.authenticate(credential.as_deref()).await {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "WebSocket connection refused");
            return Err(e);
        }
    };

    Ok(ws.on_upgrade(move |socket| run_session(socket, user, state)))
}

async fn run_session(socket: WebSocket, user: User, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = state.authenticator.admit(&user, tx);

    let mut writer = tokio::spawn(async move {
        if let Err(e) = drain_outbound(rx, &mut sink).await {
            debug!(error = %e, "Socket writer stopped");
        }
    });

    let mut closed_by_server = false;
    loop {
        let frame = tokio::select! {
            biased;
            _ = handle.closed() => {
                closed_by_server = true;
                break;
            }
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(user = %user.id, error = %e, "Socket read failed");
                break;
            }
        };

        if !state.event_limiter.check(user.id).await {
            warn!(user = %user.id, "Realtime event rate limit exceeded");
            continue;
        }

        match ClientEvent::from_json(text.as_str()) {
            Ok(event) => state.realtime.dispatch(&handle, event).await,
            Err(e) => {
                debug!(user = %user.id, error = %e, "Unparseable client event");
                state.registry.send(
                    &user.id,
                    ServerEvent::SendError(SendError {
                        reason: format!("invalid event: {e}"),
                        ..Default::default()
                    }),
                );
            }
        }
    }

    state.registry.unregister(&user.id, handle.id);
    if closed_by_server {
        // Give the writer a moment to flush the close frame.
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await;
    }
    writer.abort();
    let duration_secs = (chrono::Utc::now() - handle.connected_at).num_seconds();
    info!(user = %handle.user, connection = %handle.id.short(), duration_secs, closed_by_server, "Session closed");
}

async fn drain_outbound<S>(mut rx: OutboundRx, sink: &mut S) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Event(event) => match event.to_json() {
                Ok(json) => sink.send(Message::Text(json.into())).await?,
                Err(e) => error!(event = event.name(), error = %e, "Failed to serialize event"),
            },
            Outbound::Close(reason) => {
                sink.send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY,
                    reason: reason.as_str().into(),
                })))
                .await?;
                break;
            }
        }
    }
    Ok(())
}

/// Realtime operations reachable from a socket.
#[derive(Clone)]
pub struct Realtime {
    fanout: FanoutEngine,
    signaling: SignalingRelay,
    registry: Arc<ConnectionRegistry>,
}

impl Realtime {
    pub fn new(
        fanout: FanoutEngine,
        signaling: SignalingRelay,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            fanout,
            signaling,
            registry,
        }
    }

    /// Handle one client event. Failures never close the connection.
    ///
    /// Events from a connection that is no longer the user's registered one
    /// (replaced, evicted, user deleted) are dropped.
    pub async fn dispatch(&self, connection: &ConnectionHandle, event: ClientEvent) {
        let name = event.name();
        let sender = connection.user;
        if !self.registry.is_current(&sender, connection.id) {
            debug!(user = %sender, connection = %connection.id.short(), event = name, "Event from stale connection dropped");
            return;
        }
        let (result, context) = match event {
            ClientEvent::SendDirectMessage(req) => {
                let context = SendError {
                    correlation_token: req.correlation_token.clone(),
                    recipient_id: Some(req.recipient),
                    ..Default::default()
                };
                let result = match req.body.into_body() {
                    Ok(body) => self
                        .fanout
                        .send_direct(sender, req.recipient, body, req.correlation_token)
                        .await
                        .map(drop),
                    Err(e) => Err(e.into()),
                };
                (result, context)
            }
            ClientEvent::SendChannelMessage(req) => {
                let context = SendError {
                    correlation_token: req.correlation_token.clone(),
                    channel_id: Some(req.channel_id),
                    ..Default::default()
                };
                let result = match req.body.into_body() {
                    Ok(body) => self
                        .fanout
                        .send_channel(sender, req.channel_id, body, req.mentions, req.correlation_token)
                        .await
                        .map(drop),
                    Err(e) => Err(e.into()),
                };
                (result, context)
            }
            ClientEvent::EditMessage(req) => (
                self.fanout
                    .edit_message(sender, req.message_id, &req.new_content)
                    .await
                    .map(drop),
                SendError {
                    message_id: Some(req.message_id),
                    ..Default::default()
                },
            ),
            ClientEvent::DeleteMessage(req) => (
                self.fanout
                    .delete_message(sender, req.message_id)
                    .await
                    .map(drop),
                SendError {
                    message_id: Some(req.message_id),
                    ..Default::default()
                },
            ),
            ClientEvent::PinMessage(req) => (
                self.fanout
                    .pin_message(sender, req.channel_id, req.message_id)
                    .await
                    .map(drop),
                SendError {
                    channel_id: Some(req.channel_id),
                    message_id: req.message_id,
                    ..Default::default()
                },
            ),
            ClientEvent::AddChannelNotify(channel) => (
                self.fanout
                    .notify_channel_added(sender, channel.id)
                    .await
                    .map(drop),
                SendError {
                    channel_id: Some(channel.id),
                    ..Default::default()
                },
            ),
            ClientEvent::Offer(req) => return self.signal(sender, SignalKind::Offer, req),
            ClientEvent::Answer(req) => return self.signal(sender, SignalKind::Answer, req),
            ClientEvent::Candidate(req) => return self.signal(sender, SignalKind::Candidate, req),
            ClientEvent::End(req) => return self.signal(sender, SignalKind::End, req),
            ClientEvent::Reject(req) => return self.signal(sender, SignalKind::Reject, req),
        };

        if let Err(e) = result {
            self.report(sender, name, e, context);
        }
    }

    fn signal(&self, sender: UserId, kind: SignalKind, req: SignalRequest) {
        self.signaling.relay(sender, kind, req.target, req.payload);
    }

    fn report(&self, sender: UserId, event: &'static str, err: ServerError, context: SendError) {
        let reason = match &err {
            ServerError::Forbidden(_) | ServerError::InvalidState(_) => {
                warn!(user = %sender, event, error = %err, "Event ignored");
                return;
            }
            ServerError::NotFound(_) | ServerError::BadRequest(_) => err.to_string(),
            _ => {
                error!(user = %sender, event, error = %err, "Event failed");
                "internal error".to_string()
            }
        };
        self.registry
            .send(&sender, ServerEvent::SendError(SendError { reason, ..context }));
    }
}
