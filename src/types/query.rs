use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Citation, HistoryEntry};

/// Endpoint for plain questions.
pub const QUERY_ENDPOINT: &str = "/query";

/// Endpoint for questions about a selected passage.
pub const QUERY_SELECTION_ENDPOINT: &str = "/query-selection";

/// Body of a `POST /query` or `POST /query-selection` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    /// Conversation identity.
    pub session_id: String,

    /// The user's question.
    pub question: String,

    /// Prior turns, oldest first.
    #[serde(default)]
    pub conversation_history: Vec<HistoryEntry>,

    /// Passage the question is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
}

impl QueryRequest {
    /// Creates a request with no history or selection.
    pub fn new(session_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            question: question.into(),
            conversation_history: Vec::new(),
            selected_text: None,
        }
    }

    /// Sets the conversation history.
    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.conversation_history = history;
        self
    }

    /// Attaches selected text.  Empty selections are dropped.
    pub fn with_selected_text(mut self, selected_text: Option<String>) -> Self {
        self.selected_text = selected_text.filter(|text| !text.is_empty());
        self
    }

    /// Returns the endpoint path this request is sent to.
    pub fn endpoint(&self) -> &'static str {
        if self.selected_text.is_some() {
            QUERY_SELECTION_ENDPOINT
        } else {
            QUERY_ENDPOINT
        }
    }
}

/// Summary carried by the terminal `done` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DoneSummary {
    /// Backend identifier of the answered query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,

    /// Mean retrieval score of the passages used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,

    /// Any other keys the backend sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A decoded event from the answer stream.
///
/// Backend `error` frames are not represented here; they surface as the stream's
/// terminal `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    /// An incremental fragment of answer text.
    Chunk(String),

    /// A citation for the answer.
    Citation(Citation),

    /// The answer is complete.
    Done(DoneSummary),
}

impl QueryEvent {
    /// Returns true if no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::Done(_))
    }
}
