//! Integration tests for the session driver and in-memory backend
//!
//! These tests run whole conversations end to end: a [`SessionDriver`] on top of
//! an [`InMemoryBackend`], with tokio's clock paused so quiet windows and scroll
//! delays elapse deterministically.
//!
//! Tests cover:
//! - Sending, streaming and finalizing a reply
//! - Snapshot idempotence and stale snapshots after a switch
//! - Durable merge when a stream outruns storage
//! - Deleting the active conversation and refusing empty input
//! - Configuration files feeding the driver

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::time::{advance, Instant};

use chat_conductor::backend::{ConversationService, InMemoryBackend};
use chat_conductor::config::{load_config_from_path, SessionConfig};
use chat_conductor::{
    ChatModel, ChatSession, ConversationId, DurableMessage, MergeResolution, Message, MessageId,
    SendCompletion, SendRejection, SessionDriver, StreamId,
};

// =============================================================================
// Helpers
// =============================================================================

const QUIET: Duration = Duration::from_millis(2000);

fn manual() -> (Arc<InMemoryBackend>, SessionDriver<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::new());
    let driver = SessionDriver::new(Arc::clone(&backend), SessionConfig::default());
    (backend, driver)
}

fn echo() -> (Arc<InMemoryBackend>, SessionDriver<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::with_responder(
        InMemoryBackend::echo_responder(),
        Duration::from_millis(20),
    ));
    let driver = SessionDriver::new(Arc::clone(&backend), SessionConfig::default());
    (backend, driver)
}

fn texts(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.text.as_str()).collect()
}

fn streaming_count(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.is_streaming).count()
}

fn ids(driver: &SessionDriver<InMemoryBackend>) -> (ConversationId, StreamId) {
    let session = driver.session();
    (
        session.current_conversation().cloned().expect("conversation"),
        session.current_stream().cloned().expect("stream"),
    )
}

fn clear_config_env_vars() {
    for key in [
        "CHAT_CONDUCTOR_QUIET_MS",
        "CHAT_CONDUCTOR_SCROLL_DELAY_MS",
        "CHAT_CONDUCTOR_DUPLICATE_WINDOW_MS",
        "CHAT_CONDUCTOR_MODEL",
    ] {
        std::env::remove_var(key);
    }
}

// =============================================================================
// Test 1: Send, stream, finalize
// =============================================================================

/// The user message appears before the backend answers, snapshots grow the
/// streaming message, and the quiet window finalizes it.
#[tokio::test(start_paused = true)]
async fn test_send_stream_and_finalize() {
    let (backend, mut driver) = manual();

    let completion = driver.send_message("Hello").await.unwrap();
    assert!(matches!(completion, SendCompletion::Accepted { .. }));
    assert_eq!(texts(driver.messages()), vec!["Hello"]);
    assert!(driver.messages()[0].is_user);

    let (conversation, stream) = ids(&driver);
    backend.append_to_stream(&stream, "Hi the").unwrap();
    driver.poll().await;
    assert_eq!(texts(driver.messages()), vec!["Hello", "Hi the"]);

    backend.append_to_stream(&stream, "re!").unwrap();
    driver.poll().await;
    assert_eq!(texts(driver.messages()), vec!["Hello", "Hi there!"]);
    let reply = &driver.messages()[1];
    assert!(reply.is_streaming);
    assert_eq!(reply.id, MessageId::stream(&conversation));

    advance(QUIET - Duration::from_millis(1)).await;
    assert!(driver.poll().await.finalized.is_empty());
    assert!(driver.messages()[1].is_streaming);

    advance(Duration::from_millis(1)).await;
    let report = driver.poll().await;
    assert_eq!(report.finalized, vec![conversation]);
    assert_eq!(streaming_count(driver.messages()), 0);
    assert_eq!(texts(driver.messages()), vec!["Hello", "Hi there!"]);
}

/// Once the stream has ended, finalizing reloads the transcript from storage.
#[tokio::test(start_paused = true)]
async fn test_finalize_after_stream_end_reloads_durable() {
    let (backend, mut driver) = manual();
    driver.send_message("Hello").await.unwrap();
    let (_, stream) = ids(&driver);

    backend.append_to_stream(&stream, "Hi there!").unwrap();
    backend.complete_stream(&stream).unwrap();
    driver.poll().await;
    assert!(!driver.is_subscribed());

    advance(QUIET).await;
    driver.poll().await;

    let messages = driver.messages();
    assert_eq!(texts(messages), vec!["Hello", "Hi there!"]);
    assert!(messages[1].id.as_str().starts_with("msg_"));
    assert_eq!(messages[1].model.as_deref(), Some("gemini-2.5-flash"));
}

/// A scripted responder plays a whole turn through `run_until_quiet`.
#[tokio::test(start_paused = true)]
async fn test_echo_round_trip() {
    let (_backend, mut driver) = echo();

    driver.send_message("Hello").await.unwrap();
    driver.run_until_quiet().await;

    assert_eq!(
        texts(driver.messages()),
        vec!["Hello", "[gemini-2.5-flash] You said: Hello"]
    );
    assert_eq!(streaming_count(driver.messages()), 0);
    assert!(!driver.session().is_sending());
}

/// A reply whose first chunk takes longer than a quiet window still lands.
#[tokio::test(start_paused = true)]
async fn test_run_until_quiet_waits_for_slow_first_chunk() {
    let (backend, mut driver) = manual();
    driver.send_message("Hello").await.unwrap();
    let (_, stream) = ids(&driver);

    let writer = Arc::clone(&backend);
    tokio::spawn(async move {
        tokio::time::sleep(QUIET * 5).await;
        writer.append_to_stream(&stream, "Sorry for the wait").unwrap();
        writer.complete_stream(&stream).unwrap();
    });

    driver.run_until_quiet().await;
    assert_eq!(texts(driver.messages()), vec!["Hello", "Sorry for the wait"]);
    assert_eq!(streaming_count(driver.messages()), 0);
}

/// Continuing a conversation gets a new stream and a separate reply message.
#[tokio::test(start_paused = true)]
async fn test_second_turn_keeps_first_reply() {
    let (_backend, mut driver) = echo();

    driver.send_message("Hello").await.unwrap();
    driver.run_until_quiet().await;
    let (first_conversation, first_stream) = ids(&driver);

    driver.session_mut().set_model(ChatModel::Gpt4o);
    driver.send_message("Again").await.unwrap();
    let (conversation, stream) = ids(&driver);
    assert_eq!(conversation, first_conversation);
    assert_ne!(stream, first_stream);

    driver.run_until_quiet().await;
    assert_eq!(
        texts(driver.messages()),
        vec![
            "Hello",
            "[gemini-2.5-flash] You said: Hello",
            "Again",
            "[gpt-4o] You said: Again",
        ]
    );
    assert_eq!(driver.messages()[3].model.as_deref(), Some("gpt-4o"));
}

/// At most one message is streaming while a second turn is mid-stream.
#[tokio::test(start_paused = true)]
async fn test_single_active_stream_across_turns() {
    let (backend, mut driver) = manual();
    driver.send_message("one").await.unwrap();
    let (_, first) = ids(&driver);
    backend.append_to_stream(&first, "first reply").unwrap();
    driver.poll().await;

    driver.send_message("two").await.unwrap();
    let (_, second) = ids(&driver);
    backend.append_to_stream(&second, "second").unwrap();
    driver.poll().await;

    assert_eq!(streaming_count(driver.messages()), 1);
    assert_eq!(
        texts(driver.messages()),
        vec!["one", "first reply", "two", "second"]
    );
}

// =============================================================================
// Test 2: Snapshot idempotence
// =============================================================================

/// Two identical snapshots produce a single mutation.
#[tokio::test(start_paused = true)]
async fn test_identical_snapshots_one_mutation() {
    let (backend, mut driver) = manual();
    driver.send_message("Hello").await.unwrap();
    let (_, stream) = ids(&driver);

    backend.publish_raw(&stream, json!("partial"));
    backend.publish_raw(&stream, json!("partial"));
    let report = driver.poll().await;

    assert_eq!(report.snapshots, 2);
    assert_eq!(driver.session().watcher().mutations(), 1);
    assert_eq!(texts(driver.messages()), vec!["Hello", "partial"]);
}

/// Whitespace and malformed payloads never create a message.
#[tokio::test(start_paused = true)]
async fn test_empty_and_malformed_snapshots_ignored() {
    let (backend, mut driver) = manual();
    driver.send_message("Hello").await.unwrap();
    let (_, stream) = ids(&driver);
    let revision = driver.session().store().revision();

    backend.publish_raw(&stream, json!("   "));
    backend.publish_raw(&stream, json!({ "text": "" }));
    backend.publish_raw(&stream, json!({ "content": "nope" }));
    backend.publish_raw(&stream, json!(42));
    driver.poll().await;

    assert_eq!(driver.session().store().revision(), revision);
    assert_eq!(driver.session().watcher().snapshots_ignored(), 4);
    assert!(!driver.session().is_streaming());
}

/// Snapshot text keeps growing for non-decreasing input.
#[tokio::test(start_paused = true)]
async fn test_streaming_text_monotone() {
    let (backend, mut driver) = manual();
    driver.send_message("Count").await.unwrap();
    let (conversation, stream) = ids(&driver);

    let mut last_len = 0;
    for chunk in ["one ", "two ", "", "three"] {
        if !chunk.is_empty() {
            backend.append_to_stream(&stream, chunk).unwrap();
        }
        backend.publish_raw(&stream, json!({ "body": backend.stream_body(&stream).unwrap() }));
        driver.poll().await;
        let len = driver
            .session()
            .store()
            .stream_message(&conversation)
            .map_or(0, |m| m.text.len());
        assert!(len >= last_len);
        last_len = len;
    }
    assert_eq!(last_len, "one two three".len());
}

// =============================================================================
// Test 3: Switching conversations mid-stream
// =============================================================================

/// The old conversation's timer and snapshots never reach the new transcript.
#[tokio::test(start_paused = true)]
async fn test_switch_mid_stream_isolates_old_conversation() {
    let (backend, mut driver) = manual();
    driver.send_message("Hello").await.unwrap();
    let (old_conversation, old_stream) = ids(&driver);
    backend.append_to_stream(&old_stream, "Hi").unwrap();
    driver.poll().await;

    let other = backend
        .create_conversation("Other question", ChatModel::default())
        .await
        .unwrap();
    driver.select_conversation(other.conversation_id.clone()).await;
    assert_eq!(texts(driver.messages()), vec!["Other question"]);

    backend.append_to_stream(&old_stream, " there").unwrap();
    let late = driver.session_mut().on_snapshot(
        &old_conversation,
        &old_stream,
        &json!("Hi there"),
        Instant::now(),
    );
    assert_eq!(late, None);

    advance(QUIET * 3).await;
    let report = driver.poll().await;
    assert!(report.finalized.is_empty());
    assert_eq!(texts(driver.messages()), vec!["Other question"]);
}

/// Selecting a conversation whose stream already finished shows its reply
/// once, and it settles as a durable message.
#[tokio::test(start_paused = true)]
async fn test_select_finished_conversation() {
    let (_backend, mut driver) = echo();
    driver.send_message("Hello").await.unwrap();
    driver.run_until_quiet().await;
    let (conversation, _) = ids(&driver);

    driver.start_new();
    assert!(driver.messages().is_empty());

    driver.select_conversation(conversation).await;
    driver.run_until_quiet().await;

    assert_eq!(
        texts(driver.messages()),
        vec!["Hello", "[gemini-2.5-flash] You said: Hello"]
    );
    assert_eq!(streaming_count(driver.messages()), 0);
}

// =============================================================================
// Test 4: Durable merge
// =============================================================================

/// A streaming message that outran storage replaces the shorter durable copy.
#[tokio::test(start_paused = true)]
async fn test_durable_prefix_is_superseded_by_stream() {
    let mut session = ChatSession::new(SessionConfig::default());
    let request = session.begin_send("Hello").unwrap();
    session.finish_send(
        request.ticket(),
        Ok(chat_conductor::ConversationHandle {
            conversation_id: ConversationId::from("c1"),
            stream_id: StreamId::from("s1"),
            thread_id: None,
        }),
    );
    session.on_snapshot(
        &ConversationId::from("c1"),
        &StreamId::from("s1"),
        &json!("Hi there!"),
        Instant::now(),
    );

    let ticket = session.begin_load().unwrap();
    let resolution = session.on_durable_loaded(
        &ticket,
        vec![DurableMessage {
            id: MessageId::from("a1"),
            text: "Hi the".to_string(),
            is_user: false,
            timestamp: 1,
            model: None,
        }],
    );

    assert_eq!(resolution, Some(MergeResolution::StreamSupersedes));
    assert_eq!(texts(session.messages()), vec!["Hi there!"]);
}

// =============================================================================
// Test 5: Deleting the active conversation
// =============================================================================

/// Deleting the current conversation resets the session like starting new.
#[tokio::test(start_paused = true)]
async fn test_delete_active_conversation() {
    let (backend, mut driver) = echo();
    driver.send_message("Hello").await.unwrap();
    driver.run_until_quiet().await;
    let (conversation, _) = ids(&driver);

    assert!(driver.delete_conversation(&conversation).await);
    assert!(driver.messages().is_empty());
    assert!(driver.session().current_conversation().is_none());
    assert!(driver.session().current_stream().is_none());
    assert!(driver.session().current_thread().is_none());
    assert_eq!(backend.conversation_count(), 0);
    assert!(driver.list_conversations().await.is_empty());
}

/// A failed delete shows up in the transcript and keeps the conversation.
#[tokio::test(start_paused = true)]
async fn test_delete_failure_is_in_band() {
    let (backend, mut driver) = echo();
    driver.send_message("Hello").await.unwrap();
    driver.run_until_quiet().await;
    let (conversation, _) = ids(&driver);

    backend.fail_next(1);
    assert!(!driver.delete_conversation(&conversation).await);
    assert_eq!(driver.session().current_conversation(), Some(&conversation));
    assert_eq!(
        driver.messages().last().map(|m| m.text.as_str()),
        Some("Sorry, I encountered an error. Please try again.")
    );
}

// =============================================================================
// Test 6: Refused and failed sends
// =============================================================================

/// Empty input changes nothing and never reaches the backend.
#[tokio::test(start_paused = true)]
async fn test_empty_input_no_call() {
    let (backend, mut driver) = manual();

    assert_eq!(driver.send_message("").await, Err(SendRejection::EmptyInput));
    assert_eq!(driver.send_message("   ").await, Err(SendRejection::EmptyInput));
    assert!(driver.messages().is_empty());
    assert_eq!(driver.session().store().revision(), 0);
    assert_eq!(backend.conversation_count(), 0);
}

/// A transport failure keeps the user message and appends the error text.
#[tokio::test(start_paused = true)]
async fn test_send_failure_appends_error() {
    let (backend, mut driver) = manual();
    backend.fail_next(1);

    let completion = driver.send_message("Hello").await.unwrap();
    assert_eq!(completion, SendCompletion::Failed);
    assert_eq!(
        texts(driver.messages()),
        vec!["Hello", "Sorry, I encountered an error. Please try again."]
    );
    assert!(!driver.session().is_sending());
    assert!(driver.session().current_conversation().is_none());

    let retry = driver.send_message("Hello again").await.unwrap();
    assert!(matches!(retry, SendCompletion::Accepted { .. }));
}

/// Listing degrades to an empty history when the backend is down.
#[tokio::test(start_paused = true)]
async fn test_list_conversations() {
    let (backend, mut driver) = echo();
    driver.send_message("First conversation").await.unwrap();
    driver.run_until_quiet().await;
    driver.start_new();
    driver.send_message("Second conversation").await.unwrap();
    driver.run_until_quiet().await;

    let titles: Vec<String> = driver
        .list_conversations()
        .await
        .into_iter()
        .map(|c| c.title)
        .collect();
    assert_eq!(titles, vec!["Second conversation", "First conversation"]);

    backend.fail_next(1);
    assert!(driver.list_conversations().await.is_empty());
}

// =============================================================================
// Test 7: Scroll notifications and configuration
// =============================================================================

/// A burst of snapshots produces one scroll notification.
#[tokio::test(start_paused = true)]
async fn test_scroll_notifications_coalesce() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let backend = Arc::new(InMemoryBackend::new());
    let mut driver = SessionDriver::new(Arc::clone(&backend), SessionConfig::default())
        .with_scroll_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    driver.send_message("Hello").await.unwrap();
    let (_, stream) = ids(&driver);
    for chunk in ["a", "b", "c"] {
        backend.append_to_stream(&stream, chunk).unwrap();
    }
    driver.poll().await;

    advance(Duration::from_millis(50)).await;
    assert!(driver.poll().await.scrolled);
    advance(Duration::from_millis(50)).await;
    assert!(!driver.poll().await.scrolled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// The quiet window from a config file drives finalization.
#[tokio::test(start_paused = true)]
async fn test_config_file_quiet_window() {
    clear_config_env_vars();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[session]\nquiet_window_ms = 3000\n\n[chat]\ndefault_model = \"gpt-4o-mini\"\n")
        .unwrap();
    let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(config.quiet_window, Duration::from_millis(3000));

    let backend = Arc::new(InMemoryBackend::new());
    let mut driver = SessionDriver::new(Arc::clone(&backend), config);
    assert_eq!(driver.session().selected_model(), ChatModel::Gpt4oMini);

    driver.send_message("Hello").await.unwrap();
    let (conversation, stream) = ids(&driver);
    backend.append_to_stream(&stream, "Hi").unwrap();
    driver.poll().await;

    advance(QUIET).await;
    assert!(driver.poll().await.finalized.is_empty());
    advance(Duration::from_millis(1000)).await;
    assert_eq!(driver.poll().await.finalized, vec![conversation]);
}
