//! Log setup and id formatting.
//!
//! [`init`] installs a `tracing` subscriber writing to stderr, filtered by
//! `RUST_LOG` (default `info`). When stderr is a terminal, output is
//! colour-coded and ids rendered through [`conv_id`] / [`msg_id`] get a
//! consistent colour based on their content:
//!
//! ```text
//! 2026-02-11T21:33:12.000Z  INFO chatmirror::ingest: live upsert applied conversation=c-1203630 message=m-3EB0C4A
//! ```

use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging. Call once at startup before any logging; later calls
/// are ignored.
pub fn init() {
    let is_terminal = io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(is_terminal)
        .try_init();
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

// ANSI escape codes
const RESET: &str = "\x1b[0m";

/// Colour palette for ID hashing: bright, visually distinct colours.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[31m", // red
    "\x1b[32m", // green
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

/// Pick a deterministic colour for the given string.
fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 7;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format a conversation id with consistent colour and truncation.
///
/// Returns e.g. `c-1203630` (plain) or `\x1b[92mc-1203630\x1b[0m` (colour).
pub fn conv_id(id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}c-{short}{RESET}")
    } else {
        format!("c-{short}")
    }
}

const MSG_ID_COLOUR: &str = "\x1b[93m"; // bright yellow

/// Format a message id with consistent colour and truncation.
pub fn msg_id(id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{MSG_ID_COLOUR}m-{short}{RESET}")
    } else {
        format!("m-{short}")
    }
}
