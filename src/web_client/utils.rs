//! Shared utility functions for the web client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::content::{resolve_with_quotes, QuoteLookup, ResolveContext};
use crate::protocol::{ConversationKind, MessagePayload};
use crate::storage::MessageRecord;

/// Build a standard JSON error response.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, axum::Json(body)).into_response()
}

/// Path under which a message's media is served.
pub fn media_path(conversation_id: &str, message_id: &str) -> String {
    format!("/media/{conversation_id}/{message_id}")
}

/// Build the JSON representation of a message with its resolved content.
pub fn message_to_json(m: &MessageRecord, quotes: &dyn QuoteLookup) -> serde_json::Value {
    let payload = MessagePayload::decode(&m.payload);
    let ctx = ResolveContext {
        conversation_id: &m.conversation_id,
        message_id: &m.message_id,
        is_broadcast_channel: ConversationKind::from_conversation_id(&m.conversation_id)
            .is_broadcast_channel(),
    };
    let content = resolve_with_quotes(&payload, &ctx, quotes);
    let media_url = content
        .locator()
        .map(|_| media_path(&m.conversation_id, &m.message_id));

    serde_json::json!({
        "message_id": m.message_id,
        "conversation_id": m.conversation_id,
        "timestamp": m.timestamp,
        "received_at": m.received_at,
        "kind": payload.kind_name(),
        "content": content,
        "media_url": media_url,
    })
}
