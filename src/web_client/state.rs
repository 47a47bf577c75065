//! Shared application state and WebSocket event types.

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex};

use crate::ingest::IngestCoordinator;
use crate::media::MediaTransport;
use crate::storage::{ContactRow, Storage};
use crate::web_client::config::WS_CHANNEL_CAPACITY;

/// Events broadcast to connected WebSocket clients.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    NewMessages {
        conversation_id: String,
        messages: Vec<serde_json::Value>,
    },
    ContactsUpdated {
        contacts: Vec<ContactRow>,
    },
    HistorySync {
        in_progress: bool,
    },
    TransportStatus {
        connected: bool,
        transport_url: Option<String>,
    },
}

pub struct AppState {
    /// Read connection; the coordinator owns the write connection.
    pub storage: Storage,
    pub coordinator: Arc<Mutex<IngestCoordinator>>,
    pub media: Arc<dyn MediaTransport>,
    pub transport_url: Option<String>,
    pub started_at: Instant,
    pub ws_tx: broadcast::Sender<WsEvent>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub transport_connected: Arc<AtomicBool>,
}

pub type SharedState = Arc<Mutex<AppState>>;

impl AppState {
    pub fn new(
        storage: Storage,
        coordinator: IngestCoordinator,
        media: Arc<dyn MediaTransport>,
        transport_url: Option<String>,
    ) -> Self {
        let (ws_tx, _) = broadcast::channel(WS_CHANNEL_CAPACITY);
        Self {
            storage,
            coordinator: Arc::new(Mutex::new(coordinator)),
            media,
            transport_url,
            started_at: Instant::now(),
            ws_tx,
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            transport_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }
}
