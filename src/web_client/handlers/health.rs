//! Health check endpoint.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::web_client::state::SharedState;

pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let (message_count, uptime_secs, transport_url, transport_connected, coordinator) = {
        let st = state.lock().await;
        (
            st.storage.message_count().unwrap_or(0),
            st.started_at.elapsed().as_secs(),
            st.transport_url.clone(),
            st.transport_connected.load(Ordering::Relaxed),
            Arc::clone(&st.coordinator),
        )
    };
    let (history_sync, ingest) = {
        let mut coordinator = coordinator.lock().await;
        (coordinator.history_sync_active(), coordinator.stats().clone())
    };

    let body = serde_json::json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "messages": message_count,
        "history_sync_in_progress": history_sync,
        "transport": transport_url.as_deref().unwrap_or("none"),
        "transport_connected": transport_connected,
        "ingest": ingest,
    });
    (StatusCode::OK, axum::Json(body))
}
