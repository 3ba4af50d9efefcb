//! WebSocket gateway.
//!
//! `GET /ws?user=<id>` upgrades and drives the presence state machine for
//! the socket: connect on upgrade, heartbeat on client `heartbeat` frames and
//! on Pong, disconnect when the socket closes or its entry is swept.
//!
//! Frames are JSON text. Server to client frames are [`PresenceEvent`](crate::presence::PresenceEvent)s plus
//! `message_result` and `error`; client frames are [`ClientFrame`]s.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::presence::{ClientFrame, DirectMessenger, PresenceService};

#[derive(Debug, Deserialize)]
pub struct GatewayParams {
    pub user: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(gateway_ws))
}

async fn gateway_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<GatewayParams>,
) -> Result<impl IntoResponse, ApiError> {
    let user = params.user.trim().to_string();
    if user.is_empty() {
        return Err(ApiError::bad_request("user must not be blank"));
    }
    let presence = state
        .presence_service
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Presence not available"))?;
    let messenger = state
        .messenger
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Messaging not available"))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user, presence, messenger)))
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &impl serde::Serialize,
) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode gateway frame");
            true
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    user: String,
    presence: Arc<PresenceService>,
    messenger: Arc<DirectMessenger>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let mut outbox = match presence.on_connect(&user, &connection_id).await {
        Ok(outbox) => outbox,
        Err(e) => {
            warn!(user = %user, error = %e, "Rejecting connection");
            let _ = send_json(&mut sender, &json!({"type": "error", "message": "presence unavailable"}))
                .await;
            let _ = sender.close().await;
            return;
        }
    };

    let period = presence.config().heartbeat_interval();
    let mut heartbeat_interval = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(connection_id = %connection_id, error = %e, "Bad client frame");
                                if !send_json(&mut sender, &json!({"type": "error", "message": e.to_string()})).await {
                                    break;
                                }
                                continue;
                            }
                        };
                        if !handle_frame(frame, &user, &connection_id, &presence, &messenger, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                        if !heartbeat(&presence, &connection_id).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                }
            }

            event = outbox.recv() => {
                match event {
                    Some(event) => {
                        if !send_json(&mut sender, &event).await {
                            break;
                        }
                    }
                    // Unregistered: swept or replaced.
                    None => break,
                }
            }

            _ = heartbeat_interval.tick() => {
                if awaiting_pong {
                    debug!(connection_id = %connection_id, "Client failed to respond to Ping, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    if let Err(e) = presence.on_disconnect(&connection_id).await {
        warn!(connection_id = %connection_id, error = %e, "Failed to record disconnect");
    }
    let _ = sender.close().await;
}

/// Refresh the entry; `false` when it is gone and the socket should close.
async fn heartbeat(presence: &PresenceService, connection_id: &str) -> bool {
    match presence.on_heartbeat(connection_id).await {
        Ok(alive) => alive,
        Err(e) => {
            // Keep the socket; the next heartbeat may land.
            warn!(connection_id, error = %e, "Heartbeat failed");
            true
        }
    }
}

/// Returns `false` when the socket should close.
async fn handle_frame(
    frame: ClientFrame,
    user: &str,
    connection_id: &str,
    presence: &PresenceService,
    messenger: &DirectMessenger,
    sender: &mut SplitSink<WebSocket, Message>,
) -> bool {
    match frame {
        ClientFrame::Heartbeat => heartbeat(presence, connection_id).await,
        ClientFrame::Watch { user: target } => {
            if let Err(e) = presence.watch(connection_id, &target).await {
                warn!(connection_id, error = %e, "Watch failed");
            }
            true
        }
        ClientFrame::Unwatch { user: target } => {
            presence.unwatch(connection_id, &target);
            true
        }
        ClientFrame::Message { to, body } => {
            let outcome = messenger.send_direct_message(user, &to, &body).await;
            send_json(sender, &json!({"type": "message_result", "result": outcome})).await
        }
    }
}
