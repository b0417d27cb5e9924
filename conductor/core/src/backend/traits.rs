//! Backend Traits
//!
//! The contracts the conductor needs from the hosted chat backend. The backend
//! owns conversations, durable threads, and the append-only stream buffers
//! LLM replies are written into; the conductor only calls it.
//!
//! # Design Philosophy
//!
//! Two traits, because they are two different shapes of interaction:
//! - [`ConversationService`]: request/response calls (mutations and queries)
//! - [`StreamSource`]: a push subscription to one stream buffer
//!
//! Implementations handle the actual transport (HTTP, WebSocket, in-process).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::{ChatModel, ConversationId, DurableMessage, StreamId, ThreadId};

/// Errors returned by backend calls
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The call did not complete (network, timeout, server failure)
    #[error("transport error: {0}")]
    Transport(String),

    /// The referenced conversation does not exist
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    /// The backend refused the request
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Identifiers returned when a conversation is created or continued
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHandle {
    /// The conversation
    pub conversation_id: ConversationId,
    /// Stream the reply is being written into
    pub stream_id: StreamId,
    /// Durable thread of the conversation, when the backend reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

/// A row of the conversation history list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// The conversation
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Last update (Unix ms)
    pub updated_at: i64,
}

/// Current backend view of one conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInfo {
    /// The conversation
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// Latest stream, if any reply was ever requested
    #[serde(default)]
    pub stream_id: Option<StreamId>,
    /// Durable thread
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
}

/// Request/response calls against the chat backend
#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Create a conversation whose first turn is `prompt`
    async fn create_conversation(
        &self,
        prompt: &str,
        model: ChatModel,
    ) -> Result<ConversationHandle, ServiceError>;

    /// Add a turn to an existing conversation
    async fn continue_conversation(
        &self,
        conversation_id: &ConversationId,
        prompt: &str,
        model: ChatModel,
    ) -> Result<ConversationHandle, ServiceError>;

    /// Delete a conversation
    async fn delete_conversation(&self, conversation_id: &ConversationId)
        -> Result<(), ServiceError>;

    /// History list, most recently created first
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ServiceError>;

    /// Look up one conversation
    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationInfo>, ServiceError>;

    /// Durable messages of a conversation, oldest first
    async fn load_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DurableMessage>, ServiceError>;
}

/// Push subscription to stream buffers
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Subscribe to a stream
    ///
    /// The receiver yields raw snapshots of the accumulated text (a string, or
    /// an object with a `text` or `body` field) at arbitrary intervals, and is
    /// closed once the backend stops publishing. No explicit completion
    /// marker is sent.
    async fn subscribe(
        &self,
        stream_id: &StreamId,
    ) -> Result<mpsc::Receiver<serde_json::Value>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_display() {
        assert_eq!(
            ServiceError::Transport("timeout".into()).to_string(),
            "transport error: timeout"
        );
        assert_eq!(
            ServiceError::NotFound(ConversationId::from("c9")).to_string(),
            "conversation not found: c9"
        );
    }

    #[test]
    fn test_handle_wire_shape() {
        let handle: ConversationHandle =
            serde_json::from_str(r#"{"conversationId":"c1","streamId":"s1"}"#).unwrap();
        assert_eq!(handle.conversation_id.as_str(), "c1");
        assert_eq!(handle.stream_id.as_str(), "s1");
        assert!(handle.thread_id.is_none());
    }
}
