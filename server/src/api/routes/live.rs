//! Live alert broadcast endpoint
//!
//! `GET /v1/alerts/live` upgrades to a WebSocket and registers the client
//! with the broadcast hub, optionally filtered to one project. Outbound
//! alerts are JSON. Inbound traffic is control-only: pings are answered with
//! pongs, a connection idle past the window is closed, and control messages
//! above the size limit close the connection with a "message too large"
//! code. Slow consumers lose old alerts (counted by the hub) but are only
//! disconnected after consecutive write timeouts. Reconnection is purely
//! client-side.

use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::api::ApiState;
use crate::core::constants::{
    SUBSCRIBER_IDLE_TIMEOUT_SECS, SUBSCRIBER_MAX_CONTROL_BYTES, SUBSCRIBER_MAX_WRITE_TIMEOUTS,
    SUBSCRIBER_WRITE_TIMEOUT_SECS,
};

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    /// Restrict delivery to this project's alerts
    pub project: Option<String>,
}

pub async fn live(
    ws: WebSocketUpgrade,
    Query(query): Query<LiveQuery>,
    State(state): State<ApiState>,
) -> Response {
    // Transport cap well above the control limit: frames in between still
    // get the explicit "message too large" close frame.
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state, query.project))
}

async fn handle_socket(socket: WebSocket, state: ApiState, project_filter: Option<String>) {
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let subscription = state.hub.subscribe(&subscriber_id, project_filter.clone());
    let mut shutdown_rx = state.shutdown_rx.clone();

    tracing::debug!(
        subscriber_id = %subscriber_id,
        project = ?project_filter,
        "Live subscriber connected"
    );

    let (mut sender, mut receiver) = socket.split();

    let idle_timeout = Duration::from_secs(SUBSCRIBER_IDLE_TIMEOUT_SECS);
    let write_timeout = Duration::from_secs(SUBSCRIBER_WRITE_TIMEOUT_SECS);
    let mut last_inbound = Instant::now();
    let mut idle_check = tokio::time::interval(Duration::from_secs(5));
    let mut consecutive_write_timeouts = 0u32;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    break;
                }
            }

            _ = idle_check.tick() => {
                if last_inbound.elapsed() > idle_timeout {
                    tracing::debug!(subscriber_id = %subscriber_id, "Closing idle subscriber");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "idle timeout".into(),
                        })))
                        .await;
                    break;
                }
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        last_inbound = Instant::now();
                        if control_too_large(&message) {
                            tracing::debug!(subscriber_id = %subscriber_id, "Inbound control message too large");
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::SIZE,
                                    reason: "message too large".into(),
                                })))
                                .await;
                            break;
                        }
                        match message {
                            Message::Ping(payload) => {
                                let _ = sender.send(Message::Pong(payload)).await;
                            }
                            Message::Text(text) if text.as_str() == "ping" => {
                                let _ = sender.send(Message::Text("pong".into())).await;
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(subscriber_id = %subscriber_id, error = %e, "Subscriber read error");
                        break;
                    }
                    None => break,
                }
            }

            alert = subscription.recv() => {
                let payload = match serde_json::to_string(&alert) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, alert_id = %alert.id, "Failed to serialize alert");
                        continue;
                    }
                };
                match tokio::time::timeout(write_timeout, sender.send(Message::Text(payload.into()))).await {
                    Ok(Ok(())) => {
                        consecutive_write_timeouts = 0;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(subscriber_id = %subscriber_id, error = %e, "Subscriber write error");
                        break;
                    }
                    Err(_) => {
                        consecutive_write_timeouts += 1;
                        tracing::warn!(
                            subscriber_id = %subscriber_id,
                            consecutive = consecutive_write_timeouts,
                            "Subscriber write timed out"
                        );
                        if consecutive_write_timeouts >= SUBSCRIBER_MAX_WRITE_TIMEOUTS {
                            break;
                        }
                    }
                }
            }
        }
    }

    let dropped = subscription.dropped();
    tracing::debug!(
        subscriber_id = %subscriber_id,
        dropped,
        "Live subscriber disconnected"
    );
    // Dropping the subscription unsubscribes from the hub.
}

fn control_too_large(message: &Message) -> bool {
    let len = match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        Message::Ping(bytes) | Message::Pong(bytes) => bytes.len(),
        Message::Close(_) => 0,
    };
    len > SUBSCRIBER_MAX_CONTROL_BYTES
}
