//! Message Store
//!
//! The ordered, in-memory transcript of the active conversation. Every other
//! component mutates the transcript only through the operations here.
//!
//! Messages are kept in display order: timestamp ascending, with insertion
//! order breaking ties. The store has no internal synchronization; it is owned
//! by a single [`ChatSession`](crate::session::ChatSession) and mutated from one
//! task.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::messages::{ConversationId, Message, MessageId};

/// Result of applying a stream snapshot to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new streaming message was created
    Created,
    /// The streaming message's text was replaced
    Updated,
    /// A finalized message was extended and is streaming again
    Reopened,
    /// Text was identical, nothing changed
    Unchanged,
    /// The snapshot would shrink a finalized message
    Rejected,
}

impl UpsertOutcome {
    /// Whether the store was mutated
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Reopened)
    }
}

/// Ordered collection of messages keyed by id
#[derive(Clone, Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    revision: u64,
}

impl MessageStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in display order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of effective mutations applied so far
    ///
    /// No-op operations leave this unchanged.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message by id
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// First message matching a predicate, in display order
    pub fn find<P>(&self, predicate: P) -> Option<&Message>
    where
        P: FnMut(&&Message) -> bool,
    {
        self.messages.iter().find(predicate)
    }

    /// All messages matching a predicate, in display order
    pub fn filter<P>(&self, mut predicate: P) -> Vec<&Message>
    where
        P: FnMut(&Message) -> bool,
    {
        self.messages.iter().filter(|m| predicate(m)).collect()
    }

    /// The streaming slot of a conversation, finalized or not
    #[must_use]
    pub fn stream_message(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.get(&MessageId::stream(conversation_id))
    }

    /// The active (still streaming) message of a conversation
    #[must_use]
    pub fn streaming_message(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.stream_message(conversation_id)
            .filter(|m| m.is_streaming)
    }

    /// Whether an identical user message was added within `window` of `now`
    #[must_use]
    pub fn recent_user_duplicate(&self, text: &str, now: DateTime<Utc>, window: Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self.messages
            .iter()
            .any(|m| m.is_user && m.text == text && (now - m.timestamp).abs() < window)
    }

    /// Add a message unless one with the same id already exists
    ///
    /// Returns `true` if the message was inserted.
    pub fn append(&mut self, message: Message) -> bool {
        if self.get(&message.id).is_some() {
            return false;
        }
        self.insert_ordered(message);
        self.revision += 1;
        true
    }

    /// Create or update the streaming message of a conversation
    ///
    /// Text is replaced only when it differs byte-for-byte. A finalized message
    /// never shrinks: it is reopened by a strict extension and otherwise left
    /// untouched.
    pub fn upsert_streaming(&mut self, conversation_id: &ConversationId, text: &str) -> UpsertOutcome {
        let id = MessageId::stream(conversation_id);
        let Some(existing) = self.messages.iter_mut().find(|m| m.id == id) else {
            self.insert_ordered(Message::streaming(conversation_id, text));
            self.revision += 1;
            return UpsertOutcome::Created;
        };

        if existing.text == text {
            return UpsertOutcome::Unchanged;
        }

        if existing.is_streaming {
            existing.text = text.to_string();
            self.revision += 1;
            return UpsertOutcome::Updated;
        }

        if text.starts_with(existing.text.as_str()) {
            existing.text = text.to_string();
            existing.is_streaming = true;
            self.revision += 1;
            UpsertOutcome::Reopened
        } else {
            UpsertOutcome::Rejected
        }
    }

    /// Mark the conversation's streaming message as final
    ///
    /// Returns `true` if a message changed state. No-op if there is no
    /// streaming message or it is already final.
    pub fn finalize(&mut self, conversation_id: &ConversationId) -> bool {
        let id = MessageId::stream(conversation_id);
        match self.messages.iter_mut().find(|m| m.id == id && m.is_streaming) {
            Some(message) => {
                message.is_streaming = false;
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    /// Finalize the streaming slot and move it to a fresh id
    ///
    /// Called when a conversation starts a new stream, so the next turn gets its
    /// own message instead of overwriting the previous answer. Returns the new
    /// id of the retired message, if there was one.
    pub fn retire_streaming(&mut self, conversation_id: &ConversationId) -> Option<MessageId> {
        let id = MessageId::stream(conversation_id);
        let message = self.messages.iter_mut().find(|m| m.id == id)?;
        let retired = MessageId::retired(conversation_id);
        message.id = retired.clone();
        message.is_streaming = false;
        self.revision += 1;
        Some(retired)
    }

    /// Overwrite the whole transcript
    ///
    /// Input is re-sorted by timestamp; equal timestamps keep their input order.
    pub fn replace_all(&mut self, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.timestamp);
        self.messages = messages;
        self.revision += 1;
    }

    /// Remove every message
    pub fn clear(&mut self) {
        if !self.messages.is_empty() {
            self.messages.clear();
            self.revision += 1;
        }
    }

    fn insert_ordered(&mut self, message: Message) {
        let index = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(index, message);
    }
}
