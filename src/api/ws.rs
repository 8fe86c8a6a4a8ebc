// =============================================================================
// WebSocket status feed
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate status snapshot on connect.
//   2. A fresh snapshot every 2 s.
//
// Ping frames are answered with pongs; the loop exits on any send failure or
// a client Close frame.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

/// Interval between status pushes.
const PUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket status feed connected");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    if send_snapshot(&mut sender, &state).await.is_err() {
        return;
    }

    let mut push = interval(PUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = push.tick() => {
                if send_snapshot(&mut sender, &state).await.is_err() {
                    debug!("status feed send failed — disconnecting");
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "status feed read error");
                        break;
                    }
                }
            }
        }
    }
    info!("WebSocket status feed disconnected");
}

async fn send_snapshot(
    sender: &mut (impl SinkExt<Message> + Unpin),
    state: &Arc<AppState>,
) -> Result<(), ()> {
    let snapshot = state.status_snapshot();
    let payload = serde_json::to_string(&snapshot).map_err(|_| ())?;
    sender.send(Message::Text(payload)).await.map_err(|_| ())
}
