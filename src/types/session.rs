use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::Message;

static SESSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("session id pattern compiles")
});

/// A client-side conversation: an identity plus the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// UUID identifying the conversation to the backend.
    pub session_id: String,

    /// The transcript, oldest first.
    pub messages: Vec<Message>,

    /// When the session was minted.  Sessions saved without one load as minted now.
    #[serde(default = "OffsetDateTime::now_utc", with = "crate::utils::time")]
    pub created_at: OffsetDateTime,

    /// When the transcript last changed.
    #[serde(default, with = "crate::utils::time::option")]
    pub last_activity: Option<OffsetDateTime>,
}

impl Session {
    /// Mints a fresh session with a random v4 id and no messages.
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().hyphenated().to_string(),
            messages: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
            last_activity: None,
        }
    }

    /// Returns true if the session id has the hyphenated UUID shape.
    pub fn has_valid_id(&self) -> bool {
        is_valid_session_id(&self.session_id)
    }

    /// Returns a copy holding only the most recent `max_messages` messages.
    pub fn capped(&self, max_messages: usize) -> Self {
        let skip = self.messages.len().saturating_sub(max_messages);
        Self {
            session_id: self.session_id.clone(),
            messages: self.messages[skip..].to_vec(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns true if `id` looks like `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` in hex.
pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID.is_match(id)
}
