//! WebSocket handler for live monitor events
//!
//! Each connection registers with the broadcaster and forwards whatever it
//! receives. A text frame `ping` is answered with a `pong` message. The server
//! pings every heartbeat interval and closes connections that stayed silent
//! (no frame at all, pongs included) for longer than the heartbeat timeout.

use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::SplitSink, stream::StreamExt};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::{actors::messages::LiveMessage, api::state::ApiState};

/// WebSocket upgrade handler
///
/// GET /api/v1/ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &LiveMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(e) => {
            error!("failed to serialize {} message: {}", message.kind, e);
            Ok(())
        }
    }
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: ApiState) {
    let (connection_id, mut events) = match state.broadcaster.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("failed to register observer: {e:#}");
            return;
        }
    };
    info!("observer {connection_id} connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat_interval = Duration::from_secs(state.live.heartbeat_interval_secs);
    let heartbeat_timeout = Duration::from_secs(state.live.heartbeat_timeout_secs);
    let mut heartbeat = time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    let mut last_seen = Instant::now();

    if send_message(&mut sender, &LiveMessage::connected()).await.is_err() {
        debug!("observer {connection_id} went away before the greeting");
        state.broadcaster.disconnect(connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(message) => {
                    if send_message(&mut sender, &message).await.is_err() {
                        debug!("WebSocket send failed, observer {connection_id} disconnected");
                        break;
                    }
                }
                None => {
                    // too slow or the broadcaster stopped
                    debug!("observer {connection_id} dropped by broadcaster");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    if text.trim() == "ping"
                        && send_message(&mut sender, &LiveMessage::pong()).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => {
                    debug!("WebSocket receive failed for observer {connection_id}: {e}");
                    break;
                }
            },

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    info!("observer {connection_id} missed its heartbeat, closing");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broadcaster.disconnect(connection_id).await;
    info!("observer {connection_id} disconnected");
}
