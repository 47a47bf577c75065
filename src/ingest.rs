//! Ingestion coordinator: applies transport events to the message store.
//!
//! The coordinator owns its own [`Storage`] connection and is the only
//! writer. It tracks whether a bulk history sync is in flight; while one is,
//! live upserts are logged and dropped, relying on the transport to
//! re-deliver them. The flag clears on a batch marked final, or once
//! `history_timeout` passes without another history batch.
//!
//! Callers share one coordinator behind a `tokio::sync::Mutex`, which
//! serializes every write path.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::logging::{conv_id, msg_id};
use crate::protocol::{TransportEvent, WireContact, WireMessage};
use crate::storage::{now_secs, ContactRow, MessageRecord, Storage, StorageError};

pub const DEFAULT_HISTORY_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Running totals since the coordinator was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub live_applied: u64,
    pub live_dropped: u64,
    pub history_batches: u64,
    pub history_messages: u64,
    pub contacts_applied: u64,
    pub storage_failures: u64,
}

/// What one event changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOutcome {
    /// Messages persisted by this event.
    pub messages: Vec<MessageRecord>,
    /// Contacts persisted by this event.
    pub contacts: Vec<ContactRow>,
    /// Live messages discarded because a history sync was in flight.
    pub dropped_live: usize,
    /// Wire messages or contacts lacking an id, conversation or content.
    pub skipped: usize,
    /// Records that failed to persist. The rest of the event still applied.
    pub failed: usize,
    /// `Some(active)` when the history-sync flag flipped.
    pub history_sync_changed: Option<bool>,
}

pub struct IngestCoordinator {
    storage: Storage,
    history_timeout: Duration,
    /// Arrival time of the latest history batch while a sync is in flight.
    history_since: Option<Instant>,
    stats: IngestStats,
}

impl IngestCoordinator {
    pub fn new(storage: Storage, history_timeout: Duration) -> Self {
        Self {
            storage,
            history_timeout,
            history_since: None,
            stats: IngestStats::default(),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Whether a history sync is in flight, expiring it first if it timed out.
    pub fn history_sync_active(&mut self) -> bool {
        self.expire_history();
        self.history_since.is_some()
    }

    /// Clears a stale history flag. Returns true if it was cleared.
    fn expire_history(&mut self) -> bool {
        match self.history_since {
            Some(since) if since.elapsed() >= self.history_timeout => {
                tracing::warn!(
                    timeout_secs = self.history_timeout.as_secs(),
                    "history sync timed out without a final batch"
                );
                self.history_since = None;
                true
            }
            _ => false,
        }
    }

    /// Dispatch one transport event.
    pub fn handle(&mut self, event: TransportEvent) -> Result<IngestOutcome, IngestError> {
        let expired = self.expire_history();
        let mut outcome = match event {
            TransportEvent::LiveUpsert { messages } => self.live_upsert(&messages),
            TransportEvent::HistoryBatch {
                messages,
                contacts,
                is_final,
            } => self.history_batch(&messages, &contacts, is_final),
            TransportEvent::ContactUpsert { contacts } => self.contact_upsert(&contacts),
        }?;
        if expired && outcome.history_sync_changed.is_none() && self.history_since.is_none() {
            outcome.history_sync_changed = Some(false);
        }
        Ok(outcome)
    }

    /// Apply live messages one by one, unless a history sync is in flight.
    pub fn live_upsert(&mut self, messages: &[WireMessage]) -> Result<IngestOutcome, IngestError> {
        let (records, skipped) = records_from_wire(messages);
        let mut outcome = IngestOutcome {
            skipped,
            ..Default::default()
        };

        if self.history_sync_active() {
            for record in &records {
                tracing::info!(
                    conversation = %conv_id(&record.conversation_id),
                    message_id = %msg_id(&record.message_id),
                    "history sync in progress, dropping live message"
                );
            }
            outcome.dropped_live = records.len();
            self.stats.live_dropped += records.len() as u64;
            return Ok(outcome);
        }

        let attempted = records.len();
        for record in records {
            if let Err(e) = self.storage.upsert_message(&record) {
                self.stats.storage_failures += 1;
                outcome.failed += 1;
                tracing::error!(
                    conversation = %conv_id(&record.conversation_id),
                    message_id = %msg_id(&record.message_id),
                    "live upsert failed: {e}"
                );
                if outcome.failed == attempted {
                    return Err(e.into());
                }
                continue;
            }
            tracing::debug!(
                conversation = %conv_id(&record.conversation_id),
                message_id = %msg_id(&record.message_id),
                "live message stored"
            );
            self.stats.live_applied += 1;
            outcome.messages.push(record);
        }
        Ok(outcome)
    }

    /// Apply one history-sync batch atomically and update the sync flag.
    pub fn history_batch(
        &mut self,
        messages: &[WireMessage],
        contacts: &[WireContact],
        is_final: bool,
    ) -> Result<IngestOutcome, IngestError> {
        let started = self.history_since.is_none();
        self.history_since = Some(Instant::now());

        let (records, skipped_messages) = records_from_wire(messages);
        let (contact_rows, skipped_contacts) = contacts_from_wire(contacts);

        let written = self.storage.upsert_messages_batch(&records);

        if is_final {
            self.history_since = None;
        }
        let history_sync_changed = match (started, is_final) {
            (true, false) => Some(true),
            (false, true) => Some(false),
            _ => None,
        };

        if let Err(e) = written {
            self.stats.storage_failures += 1;
            tracing::error!(messages = records.len(), is_final, "history batch failed: {e}");
            return Err(e.into());
        }
        self.stats.history_batches += 1;
        self.stats.history_messages += records.len() as u64;

        // The messages are committed at this point, so a contact failure
        // is reported on the outcome instead of discarding it.
        let mut failed = 0;
        let contact_rows = match self.storage.upsert_contacts(&contact_rows) {
            Ok(()) => {
                self.stats.contacts_applied += contact_rows.len() as u64;
                contact_rows
            }
            Err(e) => {
                self.stats.storage_failures += 1;
                failed = contact_rows.len();
                tracing::error!(contacts = failed, "history contacts failed: {e}");
                Vec::new()
            }
        };
        tracing::info!(
            messages = records.len(),
            contacts = contact_rows.len(),
            is_final,
            "history batch stored"
        );

        Ok(IngestOutcome {
            messages: records,
            contacts: contact_rows,
            skipped: skipped_messages + skipped_contacts,
            failed,
            history_sync_changed,
            ..Default::default()
        })
    }

    pub fn contact_upsert(&mut self, contacts: &[WireContact]) -> Result<IngestOutcome, IngestError> {
        let (rows, skipped) = contacts_from_wire(contacts);
        if let Err(e) = self.storage.upsert_contacts(&rows) {
            self.stats.storage_failures += 1;
            tracing::error!(contacts = rows.len(), "contact upsert failed: {e}");
            return Err(e.into());
        }
        self.stats.contacts_applied += rows.len() as u64;
        Ok(IngestOutcome {
            contacts: rows,
            skipped,
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Wire conversion
// ---------------------------------------------------------------------------

/// Build a storable record. `None` when the id, conversation or content is
/// missing. A missing or unparseable timestamp falls back to the current time.
pub fn record_from_wire(wire: &WireMessage) -> Option<MessageRecord> {
    let message_id = wire.key.id.as_deref().filter(|s| !s.is_empty())?;
    let conversation_id = wire.key.remote_jid.as_deref().filter(|s| !s.is_empty())?;
    let content = wire.message.as_ref().filter(|m| !m.is_null())?;
    let payload = serde_json::to_vec(content).ok()?;
    let timestamp = wire
        .message_timestamp
        .as_ref()
        .and_then(|t| t.as_seconds())
        .unwrap_or_else(now_secs);
    Some(MessageRecord::new(message_id, conversation_id, timestamp, payload))
}

fn records_from_wire(messages: &[WireMessage]) -> (Vec<MessageRecord>, usize) {
    let mut records = Vec::with_capacity(messages.len());
    let mut skipped = 0;
    for wire in messages {
        match record_from_wire(wire) {
            Some(record) => records.push(record),
            None => {
                skipped += 1;
                tracing::debug!(id = ?wire.key.id, "skipping wire message without id, conversation or content");
            }
        }
    }
    (records, skipped)
}

fn contacts_from_wire(contacts: &[WireContact]) -> (Vec<ContactRow>, usize) {
    let now = now_secs();
    let rows: Vec<ContactRow> = contacts
        .iter()
        .filter(|c| !c.id.is_empty())
        .map(|c| ContactRow {
            conversation_id: c.id.clone(),
            display_name: c.name.clone(),
            notify_name: c.notify.clone(),
            avatar_url: c.img_url.clone(),
            status_text: c.status.clone(),
            updated_at: now,
        })
        .collect();
    let skipped = contacts.len() - rows.len();
    (rows, skipped)
}
