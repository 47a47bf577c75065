//! Configuration types and constants for the chatmirror-web server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::ingest::DEFAULT_HISTORY_TIMEOUT_SECS;

pub(crate) const WS_CHANNEL_CAPACITY: usize = 256;
pub(crate) const MAX_WS_CONNECTIONS: usize = 8;
/// Largest page `GET /messages` will return.
pub(crate) const MAX_PAGE_LIMIT: u32 = 500;
/// History batches can be large; accept event bodies up to this size.
pub(crate) const MAX_EVENT_BODY: usize = 64 * 1024 * 1024; // 64 MiB

/// Mirror server for a chat transport.
///
/// Persists messages and contacts pushed by the transport bridge in SQLite,
/// serves paginated reads, proxies media, and pushes new messages over a
/// WebSocket.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "chatmirror-web", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: CHATMIRROR_BIND] [default: 127.0.0.1:3000]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the database [env: CHATMIRROR_HOME] [default: ~/.chatmirror]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Transport bridge WebSocket URL to read events from [env: CHATMIRROR_TRANSPORT_URL]
    #[arg(long, short = 't')]
    pub transport_url: Option<String>,

    /// Transport bridge HTTP URL for media downloads [env: CHATMIRROR_MEDIA_URL]
    /// [default: derived from the transport URL]
    #[arg(long, short = 'm')]
    pub media_url: Option<String>,

    /// Seconds without a history batch before a sync is considered over
    /// [env: CHATMIRROR_HISTORY_TIMEOUT] [default: 120]
    #[arg(long)]
    pub history_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub transport_url: Option<String>,
    pub media_url: Option<String>,
    pub history_timeout: Duration,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("CHATMIRROR_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".chatmirror"))
                    .unwrap_or_else(|_| PathBuf::from(".chatmirror"))
            });

        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("CHATMIRROR_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:3000".to_string());

        let transport_url = cli
            .transport_url
            .or_else(|| std::env::var("CHATMIRROR_TRANSPORT_URL").ok());

        let media_url = cli
            .media_url
            .or_else(|| std::env::var("CHATMIRROR_MEDIA_URL").ok())
            .or_else(|| transport_url.as_deref().map(ws_to_http));

        let history_timeout_secs = cli
            .history_timeout_secs
            .or_else(|| {
                std::env::var("CHATMIRROR_HISTORY_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(DEFAULT_HISTORY_TIMEOUT_SECS);

        Self {
            bind_addr,
            data_dir,
            transport_url,
            media_url,
            history_timeout: Duration::from_secs(history_timeout_secs),
        }
    }
}

/// Map a WebSocket URL to the HTTP origin serving the same bridge.
fn ws_to_http(url: &str) -> String {
    let http = if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    };
    match http.find("://").map(|i| i + 3) {
        Some(host_start) => match http[host_start..].find('/') {
            Some(path_start) => http[..host_start + path_start].to_string(),
            None => http,
        },
        None => http,
    }
}
