//! chatmirror-web: mirror server for a chat transport.
//!
//! Ingests transport events into SQLite, serves paginated reads and media,
//! and pushes new messages over a WebSocket.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatmirror::web_client::run().await
}
