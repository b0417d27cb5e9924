//! Chat Messages and Identifiers
//!
//! The data model shared by every part of the conductor: the identifiers handed
//! out by the hosted backend, the in-memory [`Message`] record the UI renders,
//! and the [`DurableMessage`] shape the backend returns when a thread is read
//! back from storage.
//!
//! # Design Philosophy
//!
//! Identifiers coming from the backend are opaque. The conductor never parses
//! them; it only compares them, so each kind gets its own newtype and the
//! compiler keeps a stream id from ever being used where a conversation id is
//! expected.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap a raw identifier
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// The raw identifier
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a conversation (a "chat" on the backend)
    ConversationId
);

opaque_id!(
    /// Identifier of a server-side append-only stream buffer
    StreamId
);

opaque_id!(
    /// Identifier of the durable thread holding a conversation's messages
    ThreadId
);

opaque_id!(
    /// Message identifier, unique within one in-memory store
    MessageId
);

impl MessageId {
    /// Id for an optimistic user message
    #[must_use]
    pub fn user() -> Self {
        Self(format!("user-{}", Uuid::new_v4()))
    }

    /// Id for a synthetic assistant error message
    #[must_use]
    pub fn error() -> Self {
        Self(format!("error-{}", Uuid::new_v4()))
    }

    /// Id of the active streaming slot of a conversation
    #[must_use]
    pub fn stream(conversation_id: &ConversationId) -> Self {
        Self(format!("stream-{conversation_id}"))
    }

    /// Id given to a streaming message once a newer stream takes its slot
    #[must_use]
    pub fn retired(conversation_id: &ConversationId) -> Self {
        Self(format!("stream-{conversation_id}-{}", Uuid::new_v4()))
    }
}

/// A message in the visible transcript
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id within the store
    pub id: MessageId,
    /// Accumulated content
    pub text: String,
    /// User-authored (`true`) or assistant-authored (`false`)
    pub is_user: bool,
    /// Creation instant, used for display ordering
    pub timestamp: DateTime<Utc>,
    /// Still receiving stream updates
    #[serde(default)]
    pub is_streaming: bool,
    /// Model that produced an assistant message, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    /// Create an optimistic user message stamped with the current time
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::user(),
            text: text.into(),
            is_user: true,
            timestamp: Utc::now(),
            is_streaming: false,
            model: None,
        }
    }

    /// Create a finished assistant message
    pub fn assistant(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            is_user: false,
            timestamp: Utc::now(),
            is_streaming: false,
            model: None,
        }
    }

    /// Create the streaming message for a conversation
    pub fn streaming(conversation_id: &ConversationId, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::stream(conversation_id),
            text: text.into(),
            is_user: false,
            timestamp: Utc::now(),
            is_streaming: true,
            model: None,
        }
    }

    /// Override the timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this is an assistant message
    #[must_use]
    pub fn is_assistant(&self) -> bool {
        !self.is_user
    }
}

/// A message record as read back from durable storage
///
/// Timestamps travel as Unix milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableMessage {
    /// Storage id
    pub id: MessageId,
    /// Message content
    pub text: String,
    /// User-authored
    pub is_user: bool,
    /// Creation time (Unix ms)
    pub timestamp: i64,
    /// Model that produced the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl From<DurableMessage> for Message {
    fn from(record: DurableMessage) -> Self {
        let timestamp = DateTime::from_timestamp_millis(record.timestamp).unwrap_or_default();
        Self {
            id: record.id,
            text: record.text,
            is_user: record.is_user,
            timestamp,
            is_streaming: false,
            model: record.model,
        }
    }
}

/// Models offered by the model picker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatModel {
    /// Gemini 2.5 Flash
    #[default]
    #[serde(rename = "gemini-2.5-flash")]
    Gemini25Flash,
    /// Gemini 2.5 Pro
    #[serde(rename = "gemini-2.5-pro")]
    Gemini25Pro,
    /// GPT-4o mini
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    /// GPT-4o
    #[serde(rename = "gpt-4o")]
    Gpt4o,
}

impl ChatModel {
    /// All selectable models, in picker order
    pub const ALL: [ChatModel; 4] = [
        ChatModel::Gemini25Flash,
        ChatModel::Gemini25Pro,
        ChatModel::Gpt4oMini,
        ChatModel::Gpt4o,
    ];

    /// Wire identifier of the model
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini25Flash => "gemini-2.5-flash",
            Self::Gemini25Pro => "gemini-2.5-pro",
            Self::Gpt4oMini => "gpt-4o-mini",
            Self::Gpt4o => "gpt-4o",
        }
    }
}

impl fmt::Display for ChatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown model name
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown model: {0}")]
pub struct UnknownModel(pub String);

impl FromStr for ChatModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}
