//! Live channel: every connected client receives every broadcast event.
//!
//! On connect a client first gets the current `transport_status` and
//! `history_sync` state, then the live event stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::broadcast;

use crate::web_client::config::MAX_WS_CONNECTIONS;
use crate::web_client::state::{SharedState, WsEvent};
use crate::web_client::utils::api_error;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    let ws_count = {
        let st = state.lock().await;
        Arc::clone(&st.ws_connection_count)
    };
    let Some(slot) = ConnectionSlot::try_acquire(ws_count, MAX_WS_CONNECTIONS) else {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("too many WebSocket connections (max {MAX_WS_CONNECTIONS})"),
        );
    };

    ws.on_upgrade(move |socket| ws_connection(socket, state, slot))
        .into_response()
}

/// Holds one slot of the connection cap until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    /// Claims a slot unless `max` are already taken.
    fn try_acquire(count: Arc<AtomicUsize>, max: usize) -> Option<Self> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(count))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => socket.send(WsMessage::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!("ws event not serializable: {e}");
            true
        }
    }
}

async fn ws_connection(mut socket: WebSocket, state: SharedState, _slot: ConnectionSlot) {
    let (mut rx, snapshot) = {
        let st = state.lock().await;
        let transport = WsEvent::TransportStatus {
            connected: st.transport_connected.load(Ordering::Relaxed),
            transport_url: st.transport_url.clone(),
        };
        (st.ws_tx.subscribe(), (transport, Arc::clone(&st.coordinator)))
    };

    let (transport, coordinator) = snapshot;
    let in_progress = coordinator.lock().await.history_sync_active();
    if !send_json(&mut socket, &transport).await
        || !send_json(&mut socket, &WsEvent::HistorySync { in_progress }).await
    {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_json(&mut socket, &event).await {
                            break; // client disconnected
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws client lagged, skipped {n} events");
                        let lag = serde_json::json!({ "type": "events_missed", "count": n });
                        if !send_json(&mut socket, &lag).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = socket.send(WsMessage::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }
}
