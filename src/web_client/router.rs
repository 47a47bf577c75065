//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::web_client::config::MAX_EVENT_BODY;
use crate::web_client::handlers;
use crate::web_client::state::SharedState;

/// Build the complete Axum router.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/", get(handlers::health::health_handler))
        .route("/health", get(handlers::health::health_handler))
        // Reads
        .route("/chats", get(handlers::chats::list_chats_handler))
        .route("/contacts", get(handlers::contacts::list_contacts_handler))
        .route(
            "/messages/:conversation_id/:limit/:offset",
            get(handlers::messages::get_messages_handler),
        )
        .route(
            "/media/:conversation_id/:message_id",
            get(handlers::media::get_media_handler),
        )
        // Transport push
        .route(
            "/transport/events",
            post(handlers::events::post_event_handler)
                .layer(DefaultBodyLimit::max(MAX_EVENT_BODY)),
        )
        // WebSocket
        .route("/ws", get(handlers::websocket::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
