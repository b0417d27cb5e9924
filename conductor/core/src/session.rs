//! Chat Session
//!
//! The reconciliation state machine for one client. A [`ChatSession`] owns the
//! transcript and the stream/timer/scroll machinery, and is the only place the
//! tracked conversation, stream and thread ids change.
//!
//! # Design Philosophy
//!
//! The session performs no IO. Operations that need the backend hand back a
//! request value carrying a ticket; the host performs the call and feeds the
//! result back with that ticket. Every transition that changes what the user
//! is looking at (`select_conversation`, `start_new`, deleting the current
//! conversation) starts a new epoch, and any completion issued under an older
//! epoch is dropped on arrival. This is how late snapshots, late loads and
//! late sends are kept out of the wrong transcript.
//!
//! ```text
//!   begin_send ──► SendRequest ──► host calls service ──► finish_send
//!   begin_load ──► LoadTicket  ──► host loads records ──► on_durable_loaded
//!   host subscription ─────────────────────────────────► on_snapshot
//!   host clock ────────────────────────────────────────► tick
//! ```

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;

use crate::backend::{ConversationHandle, ConversationInfo, ServiceError};
use crate::config::SessionConfig;
use crate::merge::{MergeResolution, PersistenceMerger};
use crate::messages::{
    ChatModel, ConversationId, DurableMessage, Message, MessageId, StreamId, ThreadId,
};
use crate::store::MessageStore;
use crate::streaming::{
    CompletionTimer, ScrollCallback, ScrollScheduler, SnapshotOutcome, StreamWatcher,
};

// =============================================================================
// Tickets and requests
// =============================================================================

/// Identifies one send, issued by [`ChatSession::begin_send`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendTicket {
    epoch: u64,
    sequence: u64,
}

impl SendTicket {
    /// Epoch the send was issued in
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Identifies one durable load, issued by [`ChatSession::begin_load`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadTicket {
    epoch: u64,
    conversation_id: ConversationId,
}

impl LoadTicket {
    /// Conversation to load
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

/// Backend call the host must perform for a send
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendRequest {
    /// No conversation yet: create one with the prompt as its first message
    Create {
        /// Ticket to hand back to [`ChatSession::finish_send`]
        ticket: SendTicket,
        /// User prompt
        prompt: String,
        /// Model to answer with
        model: ChatModel,
    },
    /// Add a turn to the current conversation
    Continue {
        /// Ticket to hand back to [`ChatSession::finish_send`]
        ticket: SendTicket,
        /// Conversation to continue
        conversation_id: ConversationId,
        /// User prompt
        prompt: String,
        /// Model to answer with
        model: ChatModel,
    },
}

impl SendRequest {
    /// Ticket of the request
    #[must_use]
    pub fn ticket(&self) -> SendTicket {
        match self {
            Self::Create { ticket, .. } | Self::Continue { ticket, .. } => *ticket,
        }
    }

    /// Prompt being sent
    #[must_use]
    pub fn prompt(&self) -> &str {
        match self {
            Self::Create { prompt, .. } | Self::Continue { prompt, .. } => prompt,
        }
    }
}

/// Why a send was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendRejection {
    /// Input was empty or whitespace-only
    #[error("message is empty")]
    EmptyInput,
    /// A previous send has not completed yet
    #[error("a send is already in flight")]
    InFlight,
}

/// What [`ChatSession::finish_send`] did with a completion
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendCompletion {
    /// The backend accepted the prompt; its stream should be subscribed
    Accepted {
        /// Conversation the prompt went to
        conversation_id: ConversationId,
        /// Stream carrying the reply
        stream_id: StreamId,
    },
    /// The call failed; an error message was appended
    Failed,
    /// Issued before the last epoch change; dropped
    Stale,
}

/// Result of [`ChatSession::tick`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Conversations whose streaming message was finalized
    pub finalized: Vec<ConversationId>,
    /// Whether the scroll callback fired
    pub scrolled: bool,
}

// =============================================================================
// ChatSession
// =============================================================================

/// Reconciliation state of one chat client
#[derive(Debug)]
pub struct ChatSession {
    config: SessionConfig,
    store: MessageStore,
    watcher: StreamWatcher,
    timer: CompletionTimer,
    scroll: ScrollScheduler,
    epoch: u64,
    next_sequence: u64,
    in_flight: Option<SendTicket>,
    conversation_id: Option<ConversationId>,
    stream_id: Option<StreamId>,
    thread_id: Option<ThreadId>,
    selected_model: ChatModel,
}

impl ChatSession {
    /// Create an empty session
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            store: MessageStore::new(),
            watcher: StreamWatcher::new(),
            timer: CompletionTimer::new(config.quiet_window),
            scroll: ScrollScheduler::new(config.scroll_delay, None),
            epoch: 0,
            next_sequence: 0,
            in_flight: None,
            conversation_id: None,
            stream_id: None,
            thread_id: None,
            selected_model: config.default_model,
            config,
        }
    }

    /// Install the UI scroll notification
    #[must_use]
    pub fn with_scroll_callback(mut self, callback: ScrollCallback) -> Self {
        self.scroll.set_callback(Some(callback));
        self
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Visible transcript, display order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    /// The underlying store
    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Snapshot counters
    #[must_use]
    pub fn watcher(&self) -> &StreamWatcher {
        &self.watcher
    }

    /// Current epoch; bumped by every conversation switch
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Conversation being shown
    #[must_use]
    pub fn current_conversation(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Stream of the conversation's latest turn
    #[must_use]
    pub fn current_stream(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    /// Durable thread of the conversation
    #[must_use]
    pub fn current_thread(&self) -> Option<&ThreadId> {
        self.thread_id.as_ref()
    }

    /// Whether a send for the conversation being shown is waiting for the backend
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.in_flight.is_some_and(|t| t.epoch == self.epoch)
    }

    /// Whether the conversation still has a message receiving updates
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.conversation_id
            .as_ref()
            .is_some_and(|id| self.store.streaming_message(id).is_some())
    }

    /// Model used for the next send
    #[must_use]
    pub fn selected_model(&self) -> ChatModel {
        self.selected_model
    }

    /// Choose the model for subsequent sends
    pub fn set_model(&mut self, model: ChatModel) {
        self.selected_model = model;
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.timer.next_deadline(), self.scroll.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Start sending a user message
    ///
    /// Appends the optimistic user message and returns the backend call to make.
    /// An identical user message appended within the duplicate window is not
    /// appended again, but the send still goes out.
    ///
    /// # Errors
    ///
    /// Refuses empty input and sends made while another send for the same
    /// conversation is in flight. Neither touches the store. A send left over
    /// from before a conversation switch does not block.
    pub fn begin_send(&mut self, text: &str) -> Result<SendRequest, SendRejection> {
        let prompt = text.trim();
        if prompt.is_empty() {
            return Err(SendRejection::EmptyInput);
        }
        if self.is_sending() {
            tracing::debug!("Send already in flight, dropping");
            return Err(SendRejection::InFlight);
        }

        self.next_sequence += 1;
        let ticket = SendTicket {
            epoch: self.epoch,
            sequence: self.next_sequence,
        };
        self.in_flight = Some(ticket);

        let duplicate =
            self.store
                .recent_user_duplicate(prompt, Utc::now(), self.config.duplicate_window);
        if duplicate {
            tracing::debug!("Identical user message just sent, not appending again");
        } else {
            self.store.append(Message::user(prompt));
            self.scroll.request(Instant::now());
        }

        let model = self.selected_model;
        Ok(match &self.conversation_id {
            Some(conversation_id) => SendRequest::Continue {
                ticket,
                conversation_id: conversation_id.clone(),
                prompt: prompt.to_string(),
                model,
            },
            None => SendRequest::Create {
                ticket,
                prompt: prompt.to_string(),
                model,
            },
        })
    }

    /// Feed back the result of a send
    pub fn finish_send(
        &mut self,
        ticket: SendTicket,
        result: Result<ConversationHandle, ServiceError>,
    ) -> SendCompletion {
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
        }

        if ticket.epoch != self.epoch {
            tracing::debug!(
                ticket_epoch = ticket.epoch,
                epoch = self.epoch,
                "Dropping stale send completion"
            );
            return SendCompletion::Stale;
        }

        match result {
            Ok(handle) => {
                let same_conversation =
                    self.conversation_id.as_ref() == Some(&handle.conversation_id);
                if same_conversation && self.stream_id.as_ref() != Some(&handle.stream_id) {
                    self.timer.cancel(&handle.conversation_id);
                    self.store.retire_streaming(&handle.conversation_id);
                }
                if !same_conversation {
                    tracing::info!(conversation = %handle.conversation_id, "Conversation created");
                }

                self.conversation_id = Some(handle.conversation_id.clone());
                self.stream_id = Some(handle.stream_id.clone());
                if handle.thread_id.is_some() {
                    self.thread_id = handle.thread_id;
                }

                SendCompletion::Accepted {
                    conversation_id: handle.conversation_id,
                    stream_id: handle.stream_id,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Send failed");
                self.append_error();
                SendCompletion::Failed
            }
        }
    }

    // -------------------------------------------------------------------------
    // Conversation lifecycle
    // -------------------------------------------------------------------------

    /// Show another conversation
    ///
    /// Clears the transcript and cancels pending timers. The durable load that
    /// follows populates it.
    pub fn select_conversation(&mut self, conversation_id: ConversationId) {
        tracing::info!(conversation = %conversation_id, "Selecting conversation");
        self.reset_view();
        self.conversation_id = Some(conversation_id);
    }

    /// Start a brand-new empty conversation
    pub fn start_new(&mut self) {
        tracing::info!("Starting new conversation");
        self.reset_view();
        self.in_flight = None;
    }

    /// A conversation was deleted on the backend
    ///
    /// Returns `true` if it was the current one, which resets the session as
    /// [`start_new`](Self::start_new) does.
    pub fn on_conversation_deleted(&mut self, conversation_id: &ConversationId) -> bool {
        if self.conversation_id.as_ref() == Some(conversation_id) {
            self.start_new();
            true
        } else {
            false
        }
    }

    /// Deleting a conversation failed
    pub fn on_delete_failed(&mut self, conversation_id: &ConversationId, error: &ServiceError) {
        tracing::warn!(conversation = %conversation_id, error = %error, "Delete failed");
        self.append_error();
    }

    /// Conversation metadata arrived
    ///
    /// Adopts the stream and thread of the current conversation. Returns `true`
    /// if the stream changed.
    pub fn on_conversation_info(&mut self, info: &ConversationInfo) -> bool {
        if self.conversation_id.as_ref() != Some(&info.id) {
            tracing::debug!(conversation = %info.id, "Dropping info for other conversation");
            return false;
        }
        if info.thread_id.is_some() {
            self.thread_id = info.thread_id.clone();
        }
        if info.stream_id.is_some() && info.stream_id != self.stream_id {
            self.stream_id = info.stream_id.clone();
            true
        } else {
            false
        }
    }

    // -------------------------------------------------------------------------
    // Callbacks
    // -------------------------------------------------------------------------

    /// A stream snapshot arrived
    ///
    /// Returns `None` when the snapshot belongs to a conversation or stream
    /// that is no longer current. Changed snapshots restart the quiet timer.
    pub fn on_snapshot(
        &mut self,
        conversation_id: &ConversationId,
        stream_id: &StreamId,
        payload: &Value,
        now: Instant,
    ) -> Option<SnapshotOutcome> {
        if self.conversation_id.as_ref() != Some(conversation_id)
            || self.stream_id.as_ref() != Some(stream_id)
        {
            tracing::debug!(
                conversation = %conversation_id,
                stream = %stream_id,
                "Dropping stale snapshot"
            );
            return None;
        }

        let outcome =
            self.watcher
                .on_snapshot(&mut self.store, &mut self.scroll, conversation_id, payload, now);
        if outcome.changed() {
            self.timer.arm(conversation_id, now);
        }
        Some(outcome)
    }

    /// Start a durable reload of the current conversation
    #[must_use]
    pub fn begin_load(&self) -> Option<LoadTicket> {
        self.conversation_id.as_ref().map(|id| LoadTicket {
            epoch: self.epoch,
            conversation_id: id.clone(),
        })
    }

    /// Durable messages arrived
    ///
    /// Merges them into the transcript. Returns `None` for a load issued before
    /// the last epoch change.
    pub fn on_durable_loaded(
        &mut self,
        ticket: &LoadTicket,
        records: Vec<DurableMessage>,
    ) -> Option<MergeResolution> {
        if ticket.epoch != self.epoch
            || self.conversation_id.as_ref() != Some(&ticket.conversation_id)
        {
            tracing::debug!(conversation = %ticket.conversation_id, "Dropping stale load");
            return None;
        }

        let durable = records.into_iter().map(Message::from).collect();
        let outcome =
            PersistenceMerger::merge(self.store.messages(), &ticket.conversation_id, durable);

        if outcome.resolution == MergeResolution::DurableSupersedes {
            self.timer.cancel(&ticket.conversation_id);
        }
        self.store.replace_all(outcome.messages);
        self.scroll.request(Instant::now());

        Some(outcome.resolution)
    }

    /// Advance timers to `now`
    ///
    /// Finalizes conversations that went quiet and fires a due scroll
    /// notification. A timer whose conversation is gone is a no-op.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        for token in self.timer.poll_expired(now) {
            if self.conversation_id.as_ref() != Some(&token.conversation_id) {
                tracing::debug!(conversation = %token.conversation_id, "Dropping stale timer");
                continue;
            }
            if self.store.finalize(&token.conversation_id) {
                tracing::debug!(conversation = %token.conversation_id, "Stream went quiet, finalized");
                report.finalized.push(token.conversation_id);
            }
        }

        report.scrolled = self.scroll.poll(now);
        report
    }

    fn reset_view(&mut self) {
        self.epoch += 1;
        self.store.clear();
        self.timer.cancel_all();
        self.scroll.cancel();
        self.conversation_id = None;
        self.stream_id = None;
        self.thread_id = None;
    }

    fn append_error(&mut self) {
        self.store.append(Message::assistant(
            MessageId::error(),
            self.config.error_message.clone(),
        ));
        self.scroll.request(Instant::now());
    }
}
