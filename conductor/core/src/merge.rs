//! Persistence Merge
//!
//! Reconciles the in-memory transcript with messages freshly read back from
//! durable storage. Storage is authoritative for everything it holds, but it
//! may lag behind a stream that is still running, or run ahead of a stream
//! whose last snapshots were never delivered.
//!
//! # Policy
//!
//! Only the active streaming message of the conversation survives from memory.
//! It is compared against the most recent durable assistant message:
//!
//! | Relation                                  | Result                          |
//! |-------------------------------------------|---------------------------------|
//! | no active stream                          | durable verbatim                |
//! | stream text starts with durable text      | durable minus last, plus stream |
//! | durable text starts with stream text      | durable verbatim                |
//! | neither                                   | durable plus stream             |
//!
//! The in-memory message is dropped if its text repeats a durable assistant
//! message. Durable messages are never deduplicated against each other, so a
//! conversation that really did get the same answer twice keeps both.
//!
//! A stream that supersedes storage keeps its own timestamp unless the
//! replaced durable message is newer.

use crate::messages::{ConversationId, Message, MessageId};

/// Which branch of the merge policy was taken
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeResolution {
    /// No streaming message was in flight
    NoActiveStream,
    /// The in-memory stream is more complete than storage
    StreamSupersedes,
    /// Storage already holds the complete answer
    DurableSupersedes,
    /// Stream and storage hold different content; both kept
    Distinct,
}

/// Result of a merge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The new transcript, timestamp ascending
    pub messages: Vec<Message>,
    /// Branch taken
    pub resolution: MergeResolution,
    /// Assistant messages dropped as exact duplicates
    pub duplicates_removed: usize,
}

/// Deterministic merge of durable and in-memory messages
#[derive(Clone, Copy, Debug, Default)]
pub struct PersistenceMerger;

impl PersistenceMerger {
    /// Merge durable records into the current transcript of a conversation
    #[must_use]
    pub fn merge(
        current: &[Message],
        conversation_id: &ConversationId,
        durable: Vec<Message>,
    ) -> MergeOutcome {
        let stream_id = MessageId::stream(conversation_id);
        let active = current
            .iter()
            .find(|m| m.id == stream_id && m.is_streaming)
            .cloned();

        let mut messages: Vec<Message> = durable
            .into_iter()
            .map(|mut m| {
                m.is_streaming = false;
                m
            })
            .collect();
        messages.sort_by_key(|m| m.timestamp);

        let mut duplicates_removed = 0;
        let mut keep = |messages: &mut Vec<Message>, stream: Message| {
            let repeated = messages
                .iter()
                .any(|m| m.is_assistant() && m.text == stream.text);
            if repeated {
                duplicates_removed += 1;
            } else {
                messages.push(stream);
            }
        };

        let resolution = match active {
            None => MergeResolution::NoActiveStream,
            Some(mut stream) => {
                let last_durable = messages.iter().rposition(Message::is_assistant);
                match last_durable {
                    Some(index) if stream.text.starts_with(messages[index].text.as_str()) => {
                        let replaced = messages.remove(index);
                        stream.timestamp = stream.timestamp.max(replaced.timestamp);
                        if stream.model.is_none() {
                            stream.model = replaced.model;
                        }
                        keep(&mut messages, stream);
                        MergeResolution::StreamSupersedes
                    }
                    Some(index) if messages[index].text.starts_with(stream.text.as_str()) => {
                        MergeResolution::DurableSupersedes
                    }
                    _ => {
                        keep(&mut messages, stream);
                        MergeResolution::Distinct
                    }
                }
            }
        };

        messages.sort_by_key(|m| m.timestamp);

        tracing::debug!(
            conversation = %conversation_id,
            resolution = ?resolution,
            messages = messages.len(),
            duplicates_removed,
            "Merged durable messages"
        );

        MergeOutcome {
            messages,
            resolution,
            duplicates_removed,
        }
    }
}
