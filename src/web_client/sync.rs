//! Transport feed: applying events through the coordinator and fanning the
//! results out to WebSocket clients.
//!
//! Events arrive either from [`transport_listen_loop`], which keeps a
//! WebSocket open to the transport bridge, or from `POST /transport/events`.
//! Both paths go through [`apply_event`].

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt as _;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::content::ConversationIndex;
use crate::ingest::{IngestError, IngestOutcome};
use crate::protocol::TransportEvent;
use crate::storage::MessageRecord;
use crate::web_client::state::{SharedState, WsEvent};
use crate::web_client::utils::message_to_json;

/// Run one event through the coordinator and broadcast what it persisted.
pub async fn apply_event(
    state: &SharedState,
    event: TransportEvent,
) -> Result<IngestOutcome, IngestError> {
    let (coordinator, ws_tx) = {
        let st = state.lock().await;
        (Arc::clone(&st.coordinator), st.ws_tx.clone())
    };

    let outcome = {
        let mut coordinator = coordinator.lock().await;
        coordinator.handle(event)?
    };

    for event in events_for(&outcome) {
        // No subscribers is fine.
        let _ = ws_tx.send(event);
    }
    Ok(outcome)
}

/// WebSocket events describing an ingest outcome, one `new_messages` event
/// per conversation.
fn events_for(outcome: &IngestOutcome) -> Vec<WsEvent> {
    let mut events = Vec::new();

    if let Some(in_progress) = outcome.history_sync_changed {
        events.push(WsEvent::HistorySync { in_progress });
    }

    let mut by_conversation: BTreeMap<&str, Vec<MessageRecord>> = BTreeMap::new();
    for record in &outcome.messages {
        by_conversation
            .entry(record.conversation_id.as_str())
            .or_default()
            .push(record.clone());
    }
    for (conversation_id, mut records) in by_conversation {
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        let index = ConversationIndex::new(&records);
        let messages = records.iter().map(|m| message_to_json(m, &index)).collect();
        events.push(WsEvent::NewMessages {
            conversation_id: conversation_id.to_string(),
            messages,
        });
    }

    if !outcome.contacts.is_empty() {
        events.push(WsEvent::ContactsUpdated {
            contacts: outcome.contacts.clone(),
        });
    }
    events
}

async fn set_transport_status(state: &SharedState, connected: bool) {
    let st = state.lock().await;
    let was_connected = st.transport_connected.swap(connected, Ordering::Relaxed);
    if was_connected != connected {
        let _ = st.ws_tx.send(WsEvent::TransportStatus {
            connected,
            transport_url: st.transport_url.clone(),
        });
    }
}

/// Keep a WebSocket open to the transport bridge, feeding every text frame
/// to [`apply_event`]. Reconnects with exponential backoff.
pub async fn transport_listen_loop(state: SharedState) {
    let mut backoff_secs = 2u64;
    const MAX_BACKOFF_SECS: u64 = 60;

    loop {
        let transport_url = {
            let st = state.lock().await;
            match st.transport_url.clone() {
                Some(url) => url,
                None => return, // Push-only mode.
            }
        };

        match tokio_tungstenite::connect_async(&transport_url).await {
            Ok((ws_stream, _response)) => {
                backoff_secs = 2; // reset on successful connect
                tracing::info!(url = %transport_url, "transport connected");
                set_transport_status(&state, true).await;

                let (_write, mut read) = ws_stream.split();
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => handle_frame(&state, &text).await,
                        Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                            Ok(text) => handle_frame(&state, text).await,
                            Err(_) => tracing::warn!("ignoring non-utf8 transport frame"),
                        },
                        Ok(WsMessage::Close(_)) => break,
                        Err(e) => {
                            tracing::warn!("transport WS error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                set_transport_status(&state, false).await;
                tracing::warn!("transport disconnected, reconnecting in {backoff_secs}s");
            }
            Err(e) => {
                tracing::warn!("transport connection failed (retry in {backoff_secs}s): {e}");
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn handle_frame(state: &SharedState, text: &str) {
    let event = match TransportEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!("ignoring transport frame: {e}");
            return;
        }
    };
    if let Err(e) = apply_event(state, event).await {
        tracing::error!("transport event not applied: {e}");
    }
}
