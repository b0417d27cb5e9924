//! Session Driver
//!
//! Runs a [`ChatSession`] against a real backend. The driver performs the
//! requests the session asks for, owns the stream subscription of the current
//! conversation, and wakes the session when a snapshot arrives or a deadline
//! (quiet window, scroll delay) passes.
//!
//! # Event Loop
//!
//! A host that owns its own loop calls [`SessionDriver::poll`] whenever it
//! likes; a host that has nothing else to do awaits [`SessionDriver::step`],
//! or [`SessionDriver::run_until_quiet`] to let the current turn play out.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backend::{ConversationService, ConversationSummary, StreamSource};
use crate::config::SessionConfig;
use crate::merge::MergeResolution;
use crate::messages::{ConversationId, Message, StreamId};
use crate::session::{ChatSession, SendCompletion, SendRejection, SendRequest};
use crate::streaming::ScrollCallback;

/// The live subscription to one stream buffer
#[derive(Debug)]
struct Subscription {
    conversation_id: ConversationId,
    stream_id: StreamId,
    rx: mpsc::Receiver<Value>,
    received: usize,
    closed: bool,
}

/// What one [`SessionDriver::poll`] did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Snapshots taken off the subscription
    pub snapshots: usize,
    /// Conversations finalized by the quiet timer
    pub finalized: Vec<ConversationId>,
    /// Whether the scroll callback fired
    pub scrolled: bool,
}

enum Wake {
    Snapshot(Option<Value>),
    Deadline,
    Idle,
}

/// Async host for a [`ChatSession`]
pub struct SessionDriver<S> {
    service: Arc<S>,
    session: ChatSession,
    subscription: Option<Subscription>,
}

impl<S> SessionDriver<S>
where
    S: ConversationService + StreamSource,
{
    /// Create a driver with a fresh session
    pub fn new(service: Arc<S>, config: SessionConfig) -> Self {
        Self {
            service,
            session: ChatSession::new(config),
            subscription: None,
        }
    }

    /// Install the UI scroll notification
    #[must_use]
    pub fn with_scroll_callback(mut self, callback: ScrollCallback) -> Self {
        self.session = self.session.with_scroll_callback(callback);
        self
    }

    /// The session state
    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Mutable session state, e.g. to change the model
    pub fn session_mut(&mut self) -> &mut ChatSession {
        &mut self.session
    }

    /// Visible transcript
    pub fn messages(&self) -> &[Message] {
        self.session.messages()
    }

    /// The backend
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Whether a stream subscription is still delivering snapshots
    pub fn is_subscribed(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| !s.closed)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Send a user message
    ///
    /// Backend failures end up in the transcript as an error message, so the
    /// only errors returned are refusals that left the session untouched.
    ///
    /// # Errors
    ///
    /// [`SendRejection`] for empty input or a send already in flight.
    pub async fn send_message(&mut self, text: &str) -> Result<SendCompletion, SendRejection> {
        let request = self.session.begin_send(text)?;
        let ticket = request.ticket();

        let result = match &request {
            SendRequest::Create { prompt, model, .. } => {
                self.service.create_conversation(prompt, *model).await
            }
            SendRequest::Continue {
                conversation_id,
                prompt,
                model,
                ..
            } => {
                self.service
                    .continue_conversation(conversation_id, prompt, *model)
                    .await
            }
        };

        let completion = self.session.finish_send(ticket, result);
        if let SendCompletion::Accepted {
            conversation_id,
            stream_id,
        } = &completion
        {
            self.subscribe(conversation_id.clone(), stream_id.clone()).await;
            self.poll().await;
        }
        Ok(completion)
    }

    /// Show another conversation
    ///
    /// Picks up its latest stream if one exists, then loads its durable
    /// messages and merges them with whatever the stream already delivered.
    pub async fn select_conversation(&mut self, conversation_id: ConversationId) {
        self.subscription = None;
        self.session.select_conversation(conversation_id.clone());

        match self.service.get_conversation(&conversation_id).await {
            Ok(Some(info)) => {
                if self.session.on_conversation_info(&info) {
                    if let Some(stream_id) = info.stream_id {
                        self.subscribe(conversation_id, stream_id).await;
                        self.poll().await;
                    }
                }
            }
            Ok(None) => {
                tracing::warn!(conversation = %conversation_id, "Selected conversation does not exist");
            }
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, error = %e, "Failed to fetch conversation");
            }
        }

        self.refresh().await;
    }

    /// Delete a conversation
    ///
    /// Returns `true` if it was the current one and the session was reset.
    pub async fn delete_conversation(&mut self, conversation_id: &ConversationId) -> bool {
        match self.service.delete_conversation(conversation_id).await {
            Ok(()) => {
                tracing::info!(conversation = %conversation_id, "Conversation deleted");
                let was_current = self.session.on_conversation_deleted(conversation_id);
                if was_current {
                    self.subscription = None;
                }
                was_current
            }
            Err(e) => {
                self.session.on_delete_failed(conversation_id, &e);
                false
            }
        }
    }

    /// Start a brand-new empty conversation
    pub fn start_new(&mut self) {
        self.subscription = None;
        self.session.start_new();
    }

    /// Conversation history, newest first; empty if the backend is unreachable
    pub async fn list_conversations(&self) -> Vec<ConversationSummary> {
        match self.service.list_conversations().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list conversations");
                Vec::new()
            }
        }
    }

    /// Reload the current conversation from durable storage and merge
    pub async fn refresh(&mut self) -> Option<MergeResolution> {
        let ticket = self.session.begin_load()?;
        match self.service.load_messages(ticket.conversation_id()).await {
            Ok(records) => self.session.on_durable_loaded(&ticket, records),
            Err(e) => {
                tracing::warn!(
                    conversation = %ticket.conversation_id(),
                    error = %e,
                    "Failed to load durable messages"
                );
                None
            }
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Apply every snapshot already delivered, then advance timers
    ///
    /// A conversation going quiet after its stream ended triggers a durable
    /// refresh, so the final transcript matches storage.
    pub async fn poll(&mut self) -> PollReport {
        let mut report = PollReport::default();

        if let Some(sub) = self.subscription.as_mut() {
            let mut payloads = Vec::new();
            loop {
                match sub.rx.try_recv() {
                    Ok(payload) => payloads.push(payload),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        sub.closed = true;
                        break;
                    }
                }
            }

            let now = Instant::now();
            for payload in &payloads {
                self.session
                    .on_snapshot(&sub.conversation_id, &sub.stream_id, payload, now);
            }
            report.snapshots = payloads.len();
            sub.received += payloads.len();
        }

        let tick = self.session.tick(Instant::now());
        report.scrolled = tick.scrolled;
        report.finalized = tick.finalized;

        // Storage only holds the whole reply once the stream has ended
        if !report.finalized.is_empty() && !self.is_subscribed() {
            self.refresh().await;
        }
        report
    }

    /// Wait for the next snapshot or deadline and process it
    ///
    /// Returns `false` when there was nothing left to wait for, or nothing
    /// happened for a whole quiet window. A subscription that has not delivered
    /// its first snapshot yet is waited on until it does or closes.
    pub async fn step(&mut self) -> bool {
        let deadline = self.session.next_deadline();
        let idle_at = Instant::now() + self.session.config().quiet_window;
        let awaiting_first = deadline.is_none()
            && self
                .subscription
                .as_ref()
                .is_some_and(|sub| !sub.closed && sub.received == 0);
        let rx = self
            .subscription
            .as_mut()
            .filter(|sub| !sub.closed)
            .map(|sub| &mut sub.rx);

        if rx.is_none() && deadline.is_none() {
            return false;
        }

        let wake = tokio::select! {
            payload = async {
                match rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending::<Option<Value>>().await,
                }
            } => Wake::Snapshot(payload),
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None if awaiting_first => std::future::pending::<()>().await,
                    None => tokio::time::sleep_until(idle_at).await,
                }
            } => {
                if deadline.is_some() { Wake::Deadline } else { Wake::Idle }
            }
        };

        match wake {
            Wake::Snapshot(Some(payload)) => {
                if let Some(sub) = self.subscription.as_mut() {
                    sub.received += 1;
                    self.session.on_snapshot(
                        &sub.conversation_id,
                        &sub.stream_id,
                        &payload,
                        Instant::now(),
                    );
                }
            }
            Wake::Snapshot(None) => {
                if let Some(sub) = self.subscription.as_mut() {
                    tracing::debug!(stream = %sub.stream_id, "Stream subscription ended");
                    sub.closed = true;
                }
            }
            Wake::Deadline => {}
            Wake::Idle => return false,
        }

        self.poll().await;
        true
    }

    /// Process events until the current turn has finished and gone quiet
    pub async fn run_until_quiet(&mut self) {
        while self.step().await {}
    }

    async fn subscribe(&mut self, conversation_id: ConversationId, stream_id: StreamId) {
        match self.service.subscribe(&stream_id).await {
            Ok(rx) => {
                tracing::debug!(conversation = %conversation_id, stream = %stream_id, "Subscribed to stream");
                self.subscription = Some(Subscription {
                    conversation_id,
                    stream_id,
                    rx,
                    received: 0,
                    closed: false,
                });
            }
            Err(e) => {
                tracing::warn!(stream = %stream_id, error = %e, "Failed to subscribe to stream");
                self.subscription = None;
            }
        }
    }
}

impl<S> std::fmt::Debug for SessionDriver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDriver")
            .field("session", &self.session)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
