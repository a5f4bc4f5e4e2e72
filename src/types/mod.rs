// Public modules
pub mod citation;
pub mod health;
pub mod message;
pub mod query;
pub mod session;

// Re-exports
pub use citation::Citation;
pub use health::HealthStatus;
pub use message::{HistoryEntry, Message, MessageRole};
pub use query::{
    DoneSummary, QUERY_ENDPOINT, QUERY_SELECTION_ENDPOINT, QueryEvent, QueryRequest,
};
pub use session::{Session, is_valid_session_id};
