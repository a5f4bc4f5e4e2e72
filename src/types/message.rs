use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::Citation;

/// Role of a message in the conversation transcript.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User role.
    User,

    /// Assistant role.
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single turn of the conversation.
///
/// Messages are immutable once appended to a session; the transcript order is the
/// insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Who wrote the message.
    pub role: MessageRole,

    /// The message text.  Assistant text may contain `[Chapter N, Section M]` markers.
    pub content: String,

    /// When the message was appended.
    #[serde(default = "OffsetDateTime::now_utc", with = "crate::utils::time")]
    pub timestamp: OffsetDateTime,

    /// Citations collected while the answer streamed.  Always empty for user messages.
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(role: MessageRole, content: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: OffsetDateTime::now_utc(),
            citations,
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content, Vec::new())
    }

    /// Creates an assistant message with the citations gathered for it.
    pub fn assistant(content: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self::new(MessageRole::Assistant, content, citations)
    }

    /// Returns true if this is a user message.
    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }

    /// Returns true if this is an assistant message.
    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }

    /// Projects the message onto the shape sent as conversation history.
    pub fn to_history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            role: self.role,
            content: self.content.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A prior turn sent to the backend as conversation context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    /// Who wrote the message.
    pub role: MessageRole,

    /// The message text.
    pub content: String,

    /// When the message was appended.
    #[serde(with = "crate::utils::time")]
    pub timestamp: OffsetDateTime,
}
