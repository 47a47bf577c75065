//! Paginated message reads.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::content::ConversationIndex;
use crate::web_client::config::MAX_PAGE_LIMIT;
use crate::web_client::state::SharedState;
use crate::web_client::utils::{api_error, message_to_json};

/// `GET /messages/:conversation_id/:limit/:offset`
///
/// Returns up to `limit` messages, oldest first, ending `offset` messages
/// before the newest one. Quotes that reference earlier messages by id are
/// resolved against the whole conversation.
pub async fn get_messages_handler(
    State(state): State<SharedState>,
    Path((conversation_id, limit, offset)): Path<(String, u32, u32)>,
) -> Response {
    let limit = limit.min(MAX_PAGE_LIMIT);
    let st = state.lock().await;

    let page = match st.storage.get_page(&conversation_id, limit, offset) {
        Ok(page) => page,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    if page.is_empty() {
        return (StatusCode::OK, axum::Json(serde_json::json!([]))).into_response();
    }

    let history = match st.storage.get_all_for_conversation(&conversation_id) {
        Ok(history) => history,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let index = ConversationIndex::new(&history);
    let json: Vec<serde_json::Value> = page.iter().map(|m| message_to_json(m, &index)).collect();
    (StatusCode::OK, axum::Json(serde_json::json!(json))).into_response()
}
