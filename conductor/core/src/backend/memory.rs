//! In-Memory Backend
//!
//! An in-process implementation of [`ConversationService`] and [`StreamSource`]
//! that behaves like the hosted backend:
//!
//! - creating a conversation opens a durable thread, stores the prompt as the
//!   first user message and opens a stream for the reply
//! - continuing a conversation opens a *new* stream and stores the prompt
//! - stream buffers are append-only; every append is broadcast to subscribers
//!   as a `{ "text": <accumulated> }` snapshot
//! - completing a stream stores the reply in the thread and closes subscribers
//!
//! Replies are either pushed by hand ([`InMemoryBackend::append_to_stream`],
//! [`InMemoryBackend::complete_stream`]) or generated by a [`Responder`] on a
//! background task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::traits::{
    ConversationHandle, ConversationInfo, ConversationService, ConversationSummary, ServiceError,
    StreamSource,
};
use crate::messages::{ChatModel, ConversationId, DurableMessage, MessageId, StreamId, ThreadId};

/// Maximum number of conversations returned by the history list
pub const MAX_LISTED_CONVERSATIONS: usize = 50;

/// Titles are cut to this many characters
const TITLE_MAX_CHARS: usize = 50;

/// Buffered snapshots per subscriber
const SUBSCRIBER_BUFFER: usize = 64;

/// Produces the reply to a prompt as a sequence of text chunks
pub type Responder = Arc<dyn Fn(&str, ChatModel) -> Vec<String> + Send + Sync>;

/// Conversation title derived from its first prompt
///
/// The first 50 characters, with `...` appended when the prompt was longer.
#[must_use]
pub fn derive_title(prompt: &str) -> String {
    let mut chars = prompt.chars();
    let mut title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        title.push_str("...");
    }
    title
}

#[derive(Clone, Debug)]
struct ConversationRecord {
    id: ConversationId,
    title: String,
    stream_id: Option<StreamId>,
    thread_id: ThreadId,
    created_at: i64,
    updated_at: i64,
    seq: u64,
}

#[derive(Debug)]
struct StreamRecord {
    conversation_id: ConversationId,
    model: ChatModel,
    body: String,
    finished: bool,
    subscribers: Vec<mpsc::Sender<Value>>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    last_ms: i64,
    failures_pending: u32,
    conversations: HashMap<ConversationId, ConversationRecord>,
    threads: HashMap<ThreadId, Vec<DurableMessage>>,
    streams: HashMap<StreamId, StreamRecord>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    /// Strictly increasing wall-clock milliseconds
    fn now_ms(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_ms = now.max(self.last_ms + 1);
        self.last_ms
    }

    fn take_failure(&mut self) -> Result<(), ServiceError> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(ServiceError::Transport("injected failure".to_string()));
        }
        Ok(())
    }

    fn save_message(&mut self, thread_id: &ThreadId, text: &str, is_user: bool, model: Option<ChatModel>) {
        let id = MessageId::new(self.next_id("msg_"));
        let timestamp = self.now_ms();
        self.threads
            .entry(thread_id.clone())
            .or_default()
            .push(DurableMessage {
                id,
                text: text.to_string(),
                is_user,
                timestamp,
                model: model.map(|m| m.to_string()),
            });
    }

    fn open_stream(&mut self, conversation_id: &ConversationId, model: ChatModel) -> StreamId {
        let stream_id = StreamId::new(self.next_id("stream_"));
        self.streams.insert(
            stream_id.clone(),
            StreamRecord {
                conversation_id: conversation_id.clone(),
                model,
                body: String::new(),
                finished: false,
                subscribers: Vec::new(),
            },
        );
        stream_id
    }

    fn append(&mut self, stream_id: &StreamId, chunk: &str) -> Result<(), ServiceError> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| ServiceError::Rejected(format!("unknown stream {stream_id}")))?;
        if stream.finished {
            return Err(ServiceError::Rejected(format!("stream {stream_id} is finished")));
        }
        stream.body.push_str(chunk);
        let snapshot = json!({ "text": stream.body });
        broadcast(&mut stream.subscribers, &snapshot);
        Ok(())
    }

    fn complete(&mut self, stream_id: &StreamId) -> Result<(), ServiceError> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| ServiceError::Rejected(format!("unknown stream {stream_id}")))?;
        if stream.finished {
            return Ok(());
        }
        stream.finished = true;
        stream.subscribers.clear();
        let body = stream.body.clone();
        let model = stream.model;
        let conversation_id = stream.conversation_id.clone();

        let Some(thread_id) = self
            .conversations
            .get(&conversation_id)
            .map(|c| c.thread_id.clone())
        else {
            tracing::debug!(stream = %stream_id, "Stream completed for a deleted conversation");
            return Ok(());
        };
        if !body.trim().is_empty() {
            self.save_message(&thread_id, &body, false, Some(model));
        }
        Ok(())
    }
}

fn broadcast(subscribers: &mut Vec<mpsc::Sender<Value>>, snapshot: &Value) {
    subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
        Ok(()) => true,
        // A slow subscriber misses intermediate snapshots; the next one carries
        // the full text anyway.
        Err(mpsc::error::TrySendError::Full(_)) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// In-process chat backend
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
    responder: Option<Responder>,
    chunk_delay: Duration,
}

impl InMemoryBackend {
    /// Create a backend whose streams are driven by hand
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that answers every prompt with `responder`, publishing
    /// one chunk every `chunk_delay` and completing the stream afterwards
    #[must_use]
    pub fn with_responder(responder: Responder, chunk_delay: Duration) -> Self {
        Self {
            state: Arc::default(),
            responder: Some(responder),
            chunk_delay,
        }
    }

    /// A responder that echoes the prompt back word by word
    #[must_use]
    pub fn echo_responder() -> Responder {
        Arc::new(|prompt: &str, model: ChatModel| {
            let reply = format!("[{model}] You said: {prompt}");
            reply
                .split_inclusive(' ')
                .map(str::to_string)
                .collect()
        })
    }

    /// Make the next `count` service calls fail with a transport error
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_pending = count;
    }

    /// Append a chunk to a stream and broadcast the new snapshot
    ///
    /// # Errors
    ///
    /// Fails if the stream is unknown or already completed.
    pub fn append_to_stream(&self, stream_id: &StreamId, chunk: &str) -> Result<(), ServiceError> {
        self.state.lock().append(stream_id, chunk)
    }

    /// Publish an arbitrary payload to a stream's subscribers without touching
    /// its body
    pub fn publish_raw(&self, stream_id: &StreamId, payload: Value) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(stream_id) {
            broadcast(&mut stream.subscribers, &payload);
        }
    }

    /// Finish a stream: store the reply in the thread and close subscribers
    ///
    /// # Errors
    ///
    /// Fails if the stream is unknown.
    pub fn complete_stream(&self, stream_id: &StreamId) -> Result<(), ServiceError> {
        self.state.lock().complete(stream_id)
    }

    /// Current body of a stream
    #[must_use]
    pub fn stream_body(&self, stream_id: &StreamId) -> Option<String> {
        self.state.lock().streams.get(stream_id).map(|s| s.body.clone())
    }

    /// Number of live conversations
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.state.lock().conversations.len()
    }

    fn spawn_reply(&self, stream_id: StreamId, prompt: &str, model: ChatModel) {
        let Some(responder) = self.responder.clone() else {
            return;
        };
        let chunks = responder(prompt, model);
        let state = Arc::clone(&self.state);
        let delay = self.chunk_delay;
        tokio::spawn(async move {
            for chunk in chunks {
                tokio::time::sleep(delay).await;
                let appended = state.lock().append(&stream_id, &chunk);
                if let Err(e) = appended {
                    tracing::debug!(stream = %stream_id, error = %e, "Reply aborted");
                    return;
                }
            }
            tokio::time::sleep(delay).await;
            let completed = state.lock().complete(&stream_id);
            if let Err(e) = completed {
                tracing::debug!(stream = %stream_id, error = %e, "Reply completion failed");
            }
        });
    }
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBackend")
            .field("conversations", &state.conversations.len())
            .field("streams", &state.streams.len())
            .field("has_responder", &self.responder.is_some())
            .finish()
    }
}

#[async_trait]
impl ConversationService for InMemoryBackend {
    async fn create_conversation(
        &self,
        prompt: &str,
        model: ChatModel,
    ) -> Result<ConversationHandle, ServiceError> {
        let handle = {
            let mut state = self.state.lock();
            state.take_failure()?;

            let now = state.now_ms();
            let conversation_id = ConversationId::new(state.next_id("chat_"));
            let thread_id = ThreadId::new(state.next_id("thread_"));
            let stream_id = state.open_stream(&conversation_id, model);
            state.next_id += 1;
            let seq = state.next_id;
            state.conversations.insert(
                conversation_id.clone(),
                ConversationRecord {
                    id: conversation_id.clone(),
                    title: derive_title(prompt),
                    stream_id: Some(stream_id.clone()),
                    thread_id: thread_id.clone(),
                    created_at: now,
                    updated_at: now,
                    seq,
                },
            );
            state.save_message(&thread_id, prompt, true, None);

            ConversationHandle {
                conversation_id,
                stream_id,
                thread_id: Some(thread_id),
            }
        };

        tracing::debug!(conversation = %handle.conversation_id, model = %model, "Created conversation");
        self.spawn_reply(handle.stream_id.clone(), prompt, model);
        Ok(handle)
    }

    async fn continue_conversation(
        &self,
        conversation_id: &ConversationId,
        prompt: &str,
        model: ChatModel,
    ) -> Result<ConversationHandle, ServiceError> {
        let handle = {
            let mut state = self.state.lock();
            state.take_failure()?;

            let thread_id = state
                .conversations
                .get(conversation_id)
                .map(|c| c.thread_id.clone())
                .ok_or_else(|| ServiceError::NotFound(conversation_id.clone()))?;
            let stream_id = state.open_stream(conversation_id, model);
            let now = state.now_ms();
            if let Some(record) = state.conversations.get_mut(conversation_id) {
                record.stream_id = Some(stream_id.clone());
                record.updated_at = now;
            }
            state.save_message(&thread_id, prompt, true, None);

            ConversationHandle {
                conversation_id: conversation_id.clone(),
                stream_id,
                thread_id: Some(thread_id),
            }
        };

        self.spawn_reply(handle.stream_id.clone(), prompt, model);
        Ok(handle)
    }

    async fn delete_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let record = state
            .conversations
            .remove(conversation_id)
            .ok_or_else(|| ServiceError::NotFound(conversation_id.clone()))?;
        state.threads.remove(&record.thread_id);
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ServiceError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let mut records: Vec<&ConversationRecord> = state.conversations.values().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.seq.cmp(&a.seq)));
        Ok(records
            .into_iter()
            .take(MAX_LISTED_CONVERSATIONS)
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect())
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationInfo>, ServiceError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state.conversations.get(conversation_id).map(|c| ConversationInfo {
            id: c.id.clone(),
            title: c.title.clone(),
            stream_id: c.stream_id.clone(),
            thread_id: Some(c.thread_id.clone()),
        }))
    }

    async fn load_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DurableMessage>, ServiceError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let thread_id = state
            .conversations
            .get(conversation_id)
            .map(|c| c.thread_id.clone())
            .ok_or_else(|| ServiceError::NotFound(conversation_id.clone()))?;
        Ok(state.threads.get(&thread_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl StreamSource for InMemoryBackend {
    async fn subscribe(
        &self,
        stream_id: &StreamId,
    ) -> Result<mpsc::Receiver<Value>, ServiceError> {
        let mut state = self.state.lock();
        let stream = state
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| ServiceError::Rejected(format!("unknown stream {stream_id}")))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if !stream.body.is_empty() {
            // Fresh channel with spare capacity, cannot fail
            let _ = tx.try_send(json!({ "text": stream.body }));
        }
        if !stream.finished {
            stream.subscribers.push(tx);
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title("Hello"), "Hello");
        let long = "a".repeat(60);
        assert_eq!(derive_title(&long), format!("{}...", "a".repeat(50)));
        assert_eq!(derive_title(&"b".repeat(50)), "b".repeat(50));
        let accents = "é".repeat(51);
        assert_eq!(derive_title(&accents), format!("{}...", "é".repeat(50)));
    }

    #[tokio::test]
    async fn test_create_stores_prompt_and_opens_stream() {
        let backend = InMemoryBackend::new();
        let handle = backend
            .create_conversation("Hello", ChatModel::default())
            .await
            .unwrap();

        let messages = backend.load_messages(&handle.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_user);
        assert_eq!(messages[0].text, "Hello");
        assert_eq!(backend.stream_body(&handle.stream_id), Some(String::new()));

        let info = backend
            .get_conversation(&handle.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.title, "Hello");
        assert_eq!(info.stream_id, Some(handle.stream_id));
    }

    #[tokio::test]
    async fn test_stream_broadcast_and_complete() {
        let backend = InMemoryBackend::new();
        let handle = backend
            .create_conversation("Hello", ChatModel::Gpt4o)
            .await
            .unwrap();
        let mut rx = backend.subscribe(&handle.stream_id).await.unwrap();

        backend.append_to_stream(&handle.stream_id, "Hi ").unwrap();
        backend.append_to_stream(&handle.stream_id, "there!").unwrap();
        backend.complete_stream(&handle.stream_id).unwrap();

        assert_eq!(rx.recv().await, Some(json!({"text": "Hi "})));
        assert_eq!(rx.recv().await, Some(json!({"text": "Hi there!"})));
        assert_eq!(rx.recv().await, None);

        let messages = backend.load_messages(&handle.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "Hi there!");
        assert_eq!(messages[1].model.as_deref(), Some("gpt-4o"));
        assert!(messages[0].timestamp < messages[1].timestamp);

        assert!(backend.append_to_stream(&handle.stream_id, "late").is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_body() {
        let backend = InMemoryBackend::new();
        let handle = backend
            .create_conversation("Hello", ChatModel::default())
            .await
            .unwrap();
        backend.append_to_stream(&handle.stream_id, "done").unwrap();
        backend.complete_stream(&handle.stream_id).unwrap();

        let mut rx = backend.subscribe(&handle.stream_id).await.unwrap();
        assert_eq!(rx.recv().await, Some(json!({"text": "done"})));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_continue_opens_new_stream() {
        let backend = InMemoryBackend::new();
        let first = backend
            .create_conversation("One", ChatModel::default())
            .await
            .unwrap();
        let second = backend
            .continue_conversation(&first.conversation_id, "Two", ChatModel::default())
            .await
            .unwrap();

        assert_eq!(first.conversation_id, second.conversation_id);
        assert_ne!(first.stream_id, second.stream_id);
        let messages = backend.load_messages(&first.conversation_id).await.unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["One", "Two"]);
    }

    #[tokio::test]
    async fn test_continue_and_delete_missing() {
        let backend = InMemoryBackend::new();
        let missing = ConversationId::from("nope");
        assert_eq!(
            backend
                .continue_conversation(&missing, "x", ChatModel::default())
                .await,
            Err(ServiceError::NotFound(missing.clone()))
        );
        assert_eq!(
            backend.delete_conversation(&missing).await,
            Err(ServiceError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn test_list_newest_first_and_capped() {
        let backend = InMemoryBackend::new();
        for i in 0..55 {
            backend
                .create_conversation(&format!("prompt {i}"), ChatModel::default())
                .await
                .unwrap();
        }
        let list = backend.list_conversations().await.unwrap();
        assert_eq!(list.len(), MAX_LISTED_CONVERSATIONS);
        assert_eq!(list[0].title, "prompt 54");
    }

    #[tokio::test]
    async fn test_fail_next() {
        let backend = InMemoryBackend::new();
        backend.fail_next(1);
        assert!(matches!(
            backend.create_conversation("x", ChatModel::default()).await,
            Err(ServiceError::Transport(_))
        ));
        assert!(backend
            .create_conversation("x", ChatModel::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_streams_and_completes() {
        let backend = InMemoryBackend::with_responder(
            Arc::new(|_: &str, _: ChatModel| vec!["Hi ".to_string(), "there!".to_string()]),
            Duration::from_millis(10),
        );
        let handle = backend
            .create_conversation("Hello", ChatModel::default())
            .await
            .unwrap();
        let mut rx = backend.subscribe(&handle.stream_id).await.unwrap();

        assert_eq!(rx.recv().await, Some(json!({"text": "Hi "})));
        assert_eq!(rx.recv().await, Some(json!({"text": "Hi there!"})));
        assert_eq!(rx.recv().await, None);

        let messages = backend.load_messages(&handle.conversation_id).await.unwrap();
        assert_eq!(messages.last().map(|m| m.text.as_str()), Some("Hi there!"));
    }

    #[test]
    fn test_echo_responder() {
        let responder = InMemoryBackend::echo_responder();
        let chunks = responder("hi you", ChatModel::Gpt4oMini);
        assert_eq!(chunks.concat(), "[gpt-4o-mini] You said: hi you");
        assert!(chunks.len() > 1);
    }
}
