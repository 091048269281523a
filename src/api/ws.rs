// =============================================================================
// WebSocket Handler — Push feed of engine notifications
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. A `connected` message with the server time.
//   2. Every notification published afterwards (fills, placements, trigger
//      hits, trade updates, quotes, removals), one JSON text frame each.
//
// A client that falls behind the broadcast buffer is disconnected with a
// close frame rather than silently skipping messages. The handler also
// answers Ping frames and exits on Close or receive errors.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::notify::Notification;

/// Close code sent to subscribers that lagged behind the broadcast buffer.
const CLOSE_LAGGED: u16 = 4008;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Validates the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&state, &token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket subscriber accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before sending `connected` so nothing published in between
    // is missed.
    let mut notifications = state.notifier.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let hello = Notification::Connected {
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    if send_notification(&mut sender, &hello).await.is_err() {
        debug!("WebSocket closed before the connected message");
        return;
    }

    loop {
        tokio::select! {
            // ── Push: forward every broadcast notification ──────────────
            msg = notifications.recv() => {
                match msg {
                    Ok(notification) => {
                        if let Err(e) = send_notification(&mut sender, &notification).await {
                            debug!(error = %e, "WebSocket send failed, disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket subscriber lagged, disconnecting");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_LAGGED,
                                reason: "subscriber too slow".into(),
                            })))
                            .await;
                        break;
                    }
                    Err(RecvError::Closed) => {
                        info!("notifier closed, ending WebSocket session");
                        break;
                    }
                }
            }

            // ── Recv: control frames from the client ────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message ignored");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket subscriber disconnected");
}

// =============================================================================
// Helpers
// =============================================================================

async fn send_notification<S>(sender: &mut S, notification: &Notification) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(notification) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "Failed to serialise notification");
            Ok(())
        }
    }
}
