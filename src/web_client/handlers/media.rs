//! On-demand media download.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use crate::logging::{conv_id, msg_id};
use crate::media::{plan_fetch, MediaError};
use crate::web_client::state::SharedState;
use crate::web_client::utils::api_error;

/// `GET /media/:conversation_id/:message_id`
///
/// 404 when the message or its media does not exist, 503 when the media
/// cannot be fetched right now.
pub async fn get_media_handler(
    State(state): State<SharedState>,
    Path((conversation_id, message_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let (fetch, transport) = {
        let st = state.lock().await;
        match plan_fetch(&st.storage, &conversation_id, &message_id) {
            Ok(fetch) => (fetch, Arc::clone(&st.media)),
            Err(e) => return media_error(e),
        }
    };

    // Runs to completion even if the client goes away; the result is dropped.
    let result = tokio::task::spawn_blocking(move || fetch.execute(transport.as_ref())).await;

    let blob = match result {
        Ok(Ok(blob)) => blob,
        Ok(Err(e)) => {
            tracing::warn!(
                conversation = %conv_id(&conversation_id),
                message_id = %msg_id(&message_id),
                "media fetch failed: {e}"
            );
            return media_error(e);
        }
        Err(e) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal error: {e}"),
            )
        }
    };

    let etag = format!("\"{}\"", hex::encode(Sha256::digest(&blob.bytes)));
    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag);
    let response_headers = [
        (header::CONTENT_TYPE, blob.content_type),
        (header::ETAG, etag),
        (header::CACHE_CONTROL, "private, max-age=86400".to_string()),
    ];
    if not_modified {
        return (StatusCode::NOT_MODIFIED, response_headers).into_response();
    }
    (StatusCode::OK, response_headers, blob.bytes).into_response()
}

fn media_error(e: MediaError) -> Response {
    match e {
        MediaError::NotFound(what) => api_error(StatusCode::NOT_FOUND, format!("{what} not found")),
        MediaError::Unavailable(reason) => {
            let body = serde_json::json!({ "error": "media unavailable", "reason": reason });
            (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
        }
        MediaError::Storage(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
