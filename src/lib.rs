// Public modules
pub mod chat;
pub mod citations;
pub mod client;
pub mod error;
pub mod notice;
pub mod observability;
pub mod rate_limit;
pub mod render;
pub mod selection;
pub mod session_store;
pub mod sse;
pub mod storage;
pub mod types;
pub mod utils;

// Re-exports
pub use client::{CancelHandle, Lectern, QueryBackend, QueryStream, RetryPolicy, with_retry};
pub use error::{Error, ErrorKind, Result};
pub use notice::ErrorNotice;
pub use observability::register_biometrics;
pub use rate_limit::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use render::{PlainTextRenderer, Renderer};
pub use selection::{SelectionConfig, SelectionMonitor, SelectionSource, SelectionState};
pub use session_store::SessionStore;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use types::*;
