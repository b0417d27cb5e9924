//! Completion Timer
//!
//! Per-conversation inactivity timers. A conversation whose stream has been
//! quiet for the configured window is reported as expired so its streaming
//! message can be finalized.
//!
//! Timers are plain deadlines in an arena keyed by conversation; nothing is
//! spawned. Each arm bumps a generation number, so a [`TimerToken`] captured
//! before a re-arm or cancel is recognisably stale.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::messages::ConversationId;

/// Identifies one arming of a conversation's timer
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken {
    /// Conversation the timer belongs to
    pub conversation_id: ConversationId,
    /// Generation of the arming
    pub generation: u64,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    deadline: Instant,
    generation: u64,
}

/// Inactivity timers keyed by conversation
#[derive(Clone, Debug)]
pub struct CompletionTimer {
    quiet_window: Duration,
    slots: HashMap<ConversationId, Slot>,
    next_generation: u64,
}

impl CompletionTimer {
    /// Create a timer with the given quiet window
    #[must_use]
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            quiet_window,
            slots: HashMap::new(),
            next_generation: 0,
        }
    }

    /// The quiet window
    #[must_use]
    pub fn quiet_window(&self) -> Duration {
        self.quiet_window
    }

    /// Start or restart the timer of a conversation
    pub fn arm(&mut self, conversation_id: &ConversationId, now: Instant) -> TimerToken {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.slots.insert(
            conversation_id.clone(),
            Slot {
                deadline: now + self.quiet_window,
                generation,
            },
        );
        TimerToken {
            conversation_id: conversation_id.clone(),
            generation,
        }
    }

    /// Cancel a conversation's timer; returns `true` if one was pending
    pub fn cancel(&mut self, conversation_id: &ConversationId) -> bool {
        self.slots.remove(conversation_id).is_some()
    }

    /// Cancel every pending timer
    pub fn cancel_all(&mut self) {
        self.slots.clear();
    }

    /// Whether a conversation has a pending timer
    #[must_use]
    pub fn is_armed(&self, conversation_id: &ConversationId) -> bool {
        self.slots.contains_key(conversation_id)
    }

    /// Whether a token still refers to the pending arming of its conversation
    #[must_use]
    pub fn is_current(&self, token: &TimerToken) -> bool {
        self.slots
            .get(&token.conversation_id)
            .is_some_and(|slot| slot.generation == token.generation)
    }

    /// Earliest pending deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().map(|slot| slot.deadline).min()
    }

    /// Remove and return every timer whose deadline has passed
    pub fn poll_expired(&mut self, now: Instant) -> Vec<TimerToken> {
        let mut expired: Vec<TimerToken> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(id, slot)| TimerToken {
                conversation_id: id.clone(),
                generation: slot.generation,
            })
            .collect();
        for token in &expired {
            self.slots.remove(&token.conversation_id);
        }
        expired.sort_by_key(|token| token.generation);
        expired
    }
}
