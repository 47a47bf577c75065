//! chatmirror-web: query and delivery server.
//!
//! Provides the REST API and WebSocket for mirrored chats, keeps a feed open
//! to the transport bridge, and persists state in SQLite.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod sync;
pub mod utils;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use crate::ingest::IngestCoordinator;
use crate::media::HttpMediaTransport;
use crate::storage::{db_path, Storage};

use config::{Cli, Config};
use state::AppState;

/// Entry point: parse CLI, open storage, start server.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    crate::logging::init();

    let db = db_path(&config.data_dir);
    tracing::info!("chatmirror-web starting");
    tracing::info!("  data directory: {}", config.data_dir.display());
    tracing::info!("  database: {}", db.display());

    // Reads and writes use separate connections to the same WAL database.
    let read_storage =
        Storage::open(&db).with_context(|| format!("opening database {}", db.display()))?;
    let write_storage = Storage::open(&db).context("opening ingest connection")?;
    tracing::info!("  messages: {}", read_storage.message_count()?);

    match &config.transport_url {
        Some(url) => tracing::info!("  transport: {url}"),
        None => tracing::info!("  transport: none configured (POST /transport/events only)"),
    }
    match &config.media_url {
        Some(url) => tracing::info!("  media bridge: {url}"),
        None => tracing::info!("  media bridge: none (only channel media can be served)"),
    }

    let coordinator = IngestCoordinator::new(write_storage, config.history_timeout);
    let media = Arc::new(HttpMediaTransport::new(config.media_url.clone()));
    let state = AppState::new(read_storage, coordinator, media, config.transport_url.clone())
        .into_shared();

    if config.transport_url.is_some() {
        let feed_state = Arc::clone(&state);
        tokio::spawn(async move {
            sync::transport_listen_loop(feed_state).await;
        });
    }

    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!("chatmirror-web listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
