//! WebSocket gateway: one task per connection.
//!
//! The socket is split; a writer task drains the connection's event queue
//! while the read loop parses client frames and dispatches them to the
//! relay. Presence and group membership are torn down when the read loop
//! ends.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::types::UserId;

use crate::api::AppState;
use crate::error::CallError;
use crate::presence::ConnectionHandle;

/// Per-connection outbound queue depth. Events beyond this are dropped.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Result<Response, CallError> {
    let user = params
        .user_id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<UserId>().ok())
        .ok_or(CallError::Unauthorized)?;

    if !state.coordinator.user_exists(user).await? {
        return Err(CallError::Unauthorized);
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);
    let handle = ConnectionHandle::new(user, tx);
    let conn = handle.id();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    state.presence.register(handle.clone()).await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, &handle, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(user = %user.short(), error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    let left = state.relay.leave_all(conn).await;
    if !left.is_empty() {
        debug!(user = %user.short(), groups = left.len(), "Left call groups on disconnect");
    }
    state.presence.unregister(user, conn).await;
    writer.abort();

    info!(user = %user.short(), conn = %conn, "Connection closed");
}

/// Dispatch one text frame from `handle`'s client.
async fn handle_frame(state: &AppState, handle: &ConnectionHandle, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(user = %handle.user().short(), error = %e, "Unparseable client frame");
            handle.send(ServerEvent::Error {
                message: format!("Invalid event: {e}"),
            });
            return;
        }
    };

    match event {
        ClientEvent::JoinCall { session_id } => {
            match state
                .coordinator
                .session_for_participant(session_id, handle.user())
                .await
            {
                Ok(session) if session.is_active() => {
                    state.relay.join(session_id, handle.clone()).await
                }
                Ok(session) => {
                    debug!(session = %session_id, state = %session.state, "Join on finished call refused");
                    handle.send(ServerEvent::Error {
                        message: format!("Call is already {}", session.state),
                    });
                }
                Err(e) => {
                    warn!(
                        user = %handle.user().short(),
                        session = %session_id,
                        error = %e,
                        "Refused to join call group"
                    );
                    handle.send(ServerEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
        ClientEvent::LeaveCall { session_id } => {
            state.relay.leave(&session_id, handle.id()).await;
        }
        signal => {
            let session_id = signal.session_id();
            if let Some(relayed) = signal.into_relayed(handle.user()) {
                state.relay.route(&session_id, handle.id(), relayed).await;
            }
        }
    }
}
