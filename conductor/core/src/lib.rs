//! Chat Conductor - Headless Stream Reconciliation for Chat Front Ends
//!
//! This crate keeps a chat client's visible transcript consistent while replies
//! stream in from a hosted backend. It is independent of any UI framework: a
//! mobile app, a TUI or a test harness drives it the same way.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          UI / Host                                │
//! │        send, select, delete, start new       scroll callback ▲    │
//! └──────────────────────────────┬───────────────────────────────┼────┘
//!                                │                               │
//! ┌──────────────────────────────┼───────────────────────────────┼────┐
//! │                       SessionDriver (async)                  │    │
//! │  ┌───────────────────────────┴───────────────────────────────┴──┐ │
//! │  │                    ChatSession (sans-IO)                      │ │
//! │  │  ┌──────────────┐ ┌───────────────┐ ┌──────────────────────┐ │ │
//! │  │  │ MessageStore │ │ StreamWatcher │ │ CompletionTimer      │ │ │
//! │  │  └──────────────┘ └───────────────┘ └──────────────────────┘ │ │
//! │  │  ┌───────────────────┐ ┌─────────────────┐                   │ │
//! │  │  │ PersistenceMerger │ │ ScrollScheduler │                   │ │
//! │  │  └───────────────────┘ └─────────────────┘                   │ │
//! │  └──────────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                │ ConversationService + StreamSource
//! ┌──────────────────────────────┴────────────────────────────────────┐
//! │                 Hosted backend (or InMemoryBackend)                │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatSession`]: the reconciliation state machine
//! - [`SessionDriver`]: runs a session against a backend
//! - [`MessageStore`]: the ordered transcript
//! - [`PersistenceMerger`]: merges durable messages with an in-flight stream
//! - [`InMemoryBackend`]: in-process backend for tests and replay
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chat_conductor::{load_config, InMemoryBackend, SessionDriver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(InMemoryBackend::with_responder(
//!         InMemoryBackend::echo_responder(),
//!         std::time::Duration::from_millis(20),
//!     ));
//!     let mut driver = SessionDriver::new(backend, load_config()?);
//!
//!     driver.send_message("Hello").await?;
//!     driver.run_until_quiet().await;
//!
//!     for message in driver.messages() {
//!         println!("{}: {}", if message.is_user { "you" } else { "ai" }, message.text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: backend traits and the in-memory implementation
//! - [`config`]: layered configuration (defaults, TOML, env, CLI)
//! - [`driver`]: async host for a session
//! - [`merge`]: durable/stream merge policy
//! - [`messages`]: identifiers and message records
//! - [`session`]: the session state machine
//! - [`store`]: the ordered transcript
//! - [`streaming`]: snapshot watcher, quiet timer and scroll notifications

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod driver;
pub mod merge;
pub mod messages;
pub mod session;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    ConversationHandle, ConversationInfo, ConversationService, ConversationSummary,
    InMemoryBackend, ServiceError, StreamSource,
};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConductorToml, ConfigError,
    ConfigOverrides, ConfigSource, SessionConfig,
};
pub use driver::{PollReport, SessionDriver};
pub use merge::{MergeOutcome, MergeResolution, PersistenceMerger};
pub use messages::{
    ChatModel, ConversationId, DurableMessage, Message, MessageId, StreamId, ThreadId,
};
pub use session::{
    ChatSession, LoadTicket, SendCompletion, SendRejection, SendRequest, SendTicket, TickReport,
};
pub use store::{MessageStore, UpsertOutcome};
pub use streaming::{
    extract_text, CompletionTimer, ScrollCallback, ScrollScheduler, SnapshotOutcome,
    StreamWatcher,
};
