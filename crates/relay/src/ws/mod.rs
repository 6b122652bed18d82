// Live subscription resolver.
//
// One WebSocket session serves any number of document subscriptions
// and inbound edits. The session owns an outbound mpsc channel; the
// fan-out broker and the session's own replies both write to it, and a
// single write loop drains it to the socket. Protocol errors are
// answered with an error frame on the same socket, never by closing
// the connection.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use formsync_common::protocol::ws::{encode_message, LiveUpdate, WsMessage};
use formsync_common::types::AccessLevel;

use crate::auth::capability::CapabilityError;
use crate::error::ErrorCode;
use crate::state::AppState;

pub async fn subscriptions_route(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| run_session(state, socket))
}

async fn run_session(state: AppState, mut socket: WebSocket) {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut session = Session::new(state, outbound);

    if send_frame(&mut socket, &WsMessage::ConnectionAck).await.is_err() {
        session.close().await;
        return;
    }

    loop {
        tokio::select! {
            queued = outbound_rx.recv() => {
                // The sender side lives in the session and the broker;
                // it cannot close while the session is alive.
                let Some(message) = queued else { break };
                if send_frame(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let frame = match inbound {
                    Some(Ok(frame)) => frame,
                    Some(Err(error)) => {
                        debug!(error = %error, "websocket receive error, closing session");
                        break;
                    }
                    None => break,
                };
                match frame {
                    Message::Text(text) => {
                        if let Some(reply) = session.handle_frame(text.as_str()).await {
                            if send_frame(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    // Pings are answered by axum; binary frames are not
                    // part of the protocol.
                    _ => {}
                }
            }
        }
    }

    session.close().await;
}

async fn send_frame(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = match encode_message(message) {
        Ok(encoded) => encoded,
        Err(error) => {
            warn!(error = %error, "failed to encode websocket frame");
            return Ok(());
        }
    };
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Per-socket protocol state, separated from the transport so tests
/// can drive it with plain frames.
struct Session {
    state: AppState,
    outbound: mpsc::UnboundedSender<WsMessage>,
    /// Connection ids this session has registered with the broker.
    connections: HashSet<Uuid>,
}

impl Session {
    fn new(state: AppState, outbound: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self { state, outbound, connections: HashSet::new() }
    }

    /// Handle one inbound text frame, returning the direct reply (if
    /// any). Live data flows through the outbound channel instead.
    async fn handle_frame(&mut self, raw: &str) -> Option<WsMessage> {
        let message = match formsync_common::protocol::ws::decode_message(raw) {
            Ok(message) => message,
            Err(error) => {
                return Some(error_frame(
                    ErrorCode::ValidationFailed,
                    format!("malformed frame: {error}"),
                ));
            }
        };

        match message {
            WsMessage::Subscribe { operation_id, resource_id, token } => {
                self.handle_subscribe(operation_id, resource_id, &token).await
            }
            WsMessage::Edit { resource_id, token, update } => {
                self.handle_edit(resource_id, &token, update).await
            }
            // Server-to-client frames arriving inbound are protocol
            // violations.
            other => Some(error_frame(
                ErrorCode::ValidationFailed,
                format!("unexpected client frame: {}", frame_name(&other)),
            )),
        }
    }

    async fn handle_subscribe(
        &mut self,
        operation_id: String,
        resource_id: Uuid,
        token: &str,
    ) -> Option<WsMessage> {
        let claims = match self.state.tokens.validate(token, AccessLevel::VIEW_LEVELS) {
            Ok(claims) => claims,
            Err(error) => return Some(capability_error_frame(error)),
        };
        if claims.resource_id != resource_id {
            return Some(error_frame(
                ErrorCode::ResourceMismatch,
                ErrorCode::ResourceMismatch.default_message(),
            ));
        }

        self.state
            .registry
            .subscribe(
                resource_id,
                claims.connection_id,
                operation_id,
                claims.access_level,
                self.outbound.clone(),
            )
            .await;
        self.connections.insert(claims.connection_id);
        None
    }

    async fn handle_edit(
        &mut self,
        resource_id: Uuid,
        token: &str,
        update: formsync_common::types::EditRequest,
    ) -> Option<WsMessage> {
        let claims = match self.state.tokens.validate(token, AccessLevel::EDIT_LEVELS) {
            Ok(claims) => claims,
            Err(error) => return Some(capability_error_frame(error)),
        };
        if claims.resource_id != resource_id {
            return Some(error_frame(
                ErrorCode::ResourceMismatch,
                ErrorCode::ResourceMismatch.default_message(),
            ));
        }
        if update.is_empty() {
            return Some(error_frame(
                ErrorCode::ValidationFailed,
                "edit carries no field updates",
            ));
        }

        if let Err(error) = self.state.queue.enqueue(resource_id, update.clone()).await {
            warn!(resource_id = %resource_id, error = %error, "edit not recorded");
            return Some(error_frame(
                ErrorCode::BufferUnavailable,
                ErrorCode::BufferUnavailable.default_message(),
            ));
        }

        self.state.flush.note_edit(resource_id).await;
        self.state
            .registry
            .publish(
                resource_id,
                LiveUpdate {
                    resource_id,
                    connection_id: claims.connection_id,
                    delta: update,
                },
            )
            .await;
        None
    }

    /// Drop every broker registration this session holds.
    ///
    /// Passes the session's own outbound sender so a registration that
    /// was already replaced by a newer socket is left alone.
    async fn close(&mut self) {
        for connection_id in self.connections.drain() {
            self.state.registry.unsubscribe(connection_id, &self.outbound).await;
        }
    }
}

fn frame_name(message: &WsMessage) -> &'static str {
    match message {
        WsMessage::ConnectionAck => "connection_ack",
        WsMessage::Subscribe { .. } => "subscribe",
        WsMessage::Edit { .. } => "edit",
        WsMessage::Data { .. } => "data",
        WsMessage::Error { .. } => "error",
    }
}

fn error_frame(code: ErrorCode, message: impl Into<String>) -> WsMessage {
    WsMessage::Error {
        code: code.as_str().to_string(),
        message: message.into(),
        retryable: code.retryable(),
    }
}

fn capability_error_frame(error: CapabilityError) -> WsMessage {
    let code = match error {
        CapabilityError::InsufficientAccess { .. } => ErrorCode::AuthInsufficientAccess,
        CapabilityError::InvalidSignature | CapabilityError::MalformedClaims(_) => {
            ErrorCode::AuthInvalidToken
        }
        CapabilityError::Signing(_) => ErrorCode::InternalError,
    };
    error_frame(code, error.to_string())
}
