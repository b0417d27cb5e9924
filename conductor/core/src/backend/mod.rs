//! Chat Backend Integration
//!
//! Abstracted access to the hosted backend that owns conversations, durable
//! message threads and reply streams, through a pair of traits.
//!
//! # Available Backends
//!
//! - **InMemory**: in-process backend with the same observable behavior,
//!   used by tests and the replay CLI
//!
//! # Usage
//!
//! ```ignore
//! use chat_conductor::backend::{ConversationService, InMemoryBackend};
//! use chat_conductor::ChatModel;
//!
//! let backend = InMemoryBackend::new();
//! let handle = backend.create_conversation("Hello", ChatModel::default()).await?;
//! ```

mod memory;
mod traits;

pub use memory::{derive_title, InMemoryBackend, Responder, MAX_LISTED_CONVERSATIONS};
pub use traits::{
    ConversationHandle, ConversationInfo, ConversationService, ConversationSummary, ServiceError,
    StreamSource,
};
