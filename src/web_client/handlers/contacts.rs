//! Contact listing handler.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::web_client::state::SharedState;
use crate::web_client::utils::api_error;

pub async fn list_contacts_handler(State(state): State<SharedState>) -> Response {
    let st = state.lock().await;
    match st.storage.list_contacts() {
        Ok(contacts) => (StatusCode::OK, axum::Json(contacts)).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
