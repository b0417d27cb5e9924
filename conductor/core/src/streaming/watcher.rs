//! Stream Watcher
//!
//! Normalizes raw stream-buffer snapshots into plain text and applies them to
//! the store.

use serde_json::Value;
use tokio::time::Instant;

use super::scroll::ScrollScheduler;
use crate::messages::ConversationId;
use crate::store::{MessageStore, UpsertOutcome};

/// Field names that may carry the accumulated text of a structured snapshot,
/// in order of preference
const TEXT_FIELDS: [&str; 2] = ["text", "body"];

/// Pull the accumulated text out of a raw snapshot
///
/// A plain string is taken as-is. An object yields the first of `text` or
/// `body` holding a non-empty string. Anything else is malformed and yields
/// `None`.
#[must_use]
pub fn extract_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(text) => Some(text.clone()),
        Value::Object(fields) => TEXT_FIELDS.iter().find_map(|name| {
            fields
                .get(*name)
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        }),
        _ => None,
    }
}

/// What a snapshot did to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Empty, whitespace-only or malformed payload; nothing happened
    Ignored,
    /// The snapshot reached the store
    Applied(UpsertOutcome),
}

impl SnapshotOutcome {
    /// Whether the store was mutated
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Applied(outcome) if outcome.changed())
    }
}

/// Applies stream snapshots to a [`MessageStore`]
#[derive(Clone, Debug, Default)]
pub struct StreamWatcher {
    snapshots_seen: u64,
    snapshots_ignored: u64,
    mutations: u64,
}

impl StreamWatcher {
    /// Create a watcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one snapshot for a conversation
    ///
    /// Identical repeated snapshots never mutate the store. When the store does
    /// change, a scroll notification is requested.
    pub fn on_snapshot(
        &mut self,
        store: &mut MessageStore,
        scroll: &mut ScrollScheduler,
        conversation_id: &ConversationId,
        raw: &Value,
        now: Instant,
    ) -> SnapshotOutcome {
        self.snapshots_seen += 1;

        let text = match extract_text(raw) {
            Some(text) if !text.trim().is_empty() => text,
            Some(_) => {
                self.snapshots_ignored += 1;
                return SnapshotOutcome::Ignored;
            }
            None => {
                self.snapshots_ignored += 1;
                tracing::debug!(conversation = %conversation_id, "Ignoring malformed snapshot");
                return SnapshotOutcome::Ignored;
            }
        };

        let outcome = store.upsert_streaming(conversation_id, &text);
        match outcome {
            UpsertOutcome::Rejected => {
                tracing::debug!(
                    conversation = %conversation_id,
                    len = text.len(),
                    "Snapshot would shrink a finalized message, ignoring"
                );
            }
            UpsertOutcome::Unchanged => {}
            _ => {
                self.mutations += 1;
                scroll.request(now);
                tracing::trace!(
                    conversation = %conversation_id,
                    len = text.len(),
                    outcome = ?outcome,
                    "Applied snapshot"
                );
            }
        }

        SnapshotOutcome::Applied(outcome)
    }

    /// Snapshots received
    #[must_use]
    pub fn snapshots_seen(&self) -> u64 {
        self.snapshots_seen
    }

    /// Snapshots dropped as empty or malformed
    #[must_use]
    pub fn snapshots_ignored(&self) -> u64 {
        self.snapshots_ignored
    }

    /// Snapshots that changed the store
    #[must_use]
    pub fn mutations(&self) -> u64 {
        self.mutations
    }
}
