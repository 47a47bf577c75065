//! Push endpoint for transport events.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::protocol::TransportEvent;
use crate::web_client::state::SharedState;
use crate::web_client::sync::apply_event;
use crate::web_client::utils::api_error;

/// `POST /transport/events`: apply one event document.
pub async fn post_event_handler(
    State(state): State<SharedState>,
    Json(event): Json<TransportEvent>,
) -> Response {
    match apply_event(&state, event).await {
        Ok(outcome) => {
            let body = serde_json::json!({
                "messages": outcome.messages.len(),
                "contacts": outcome.contacts.len(),
                "dropped_live": outcome.dropped_live,
                "skipped": outcome.skipped,
                "failed": outcome.failed,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
