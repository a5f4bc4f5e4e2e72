//! Persistence of the conversation session.
//!
//! Loading never fails: a missing, unparseable or structurally invalid session is
//! replaced by a fresh one.  Saving never fails either; a write error is logged
//! and the in-memory session stays authoritative for the rest of the process.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::observability::SESSION_PERSIST_ERRORS;
use crate::storage::{KeyValueStore, SESSION_KEY};
use crate::types::Session;

/// Default number of messages kept when a session is written.
pub const MAX_PERSISTED_MESSAGES: usize = 50;

/// Loads and saves the [`Session`] under a fixed key.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
    max_messages: usize,
}

impl SessionStore {
    /// Creates a store over `store` using the default key and message cap.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            key: SESSION_KEY.to_string(),
            max_messages: MAX_PERSISTED_MESSAGES,
        }
    }

    /// Sets how many of the most recent messages are written.
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Returns the message cap applied on save.
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Reads the persisted session, or mints a fresh one.
    pub fn load(&self) -> Session {
        match self.try_load() {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("no persisted session; starting a new one");
                Session::new()
            }
            Err(err) => {
                warn!(error = %err, "discarding persisted session");
                Session::new()
            }
        }
    }

    /// Reads the persisted session, reporting why it could not be used.
    ///
    /// Returns `Ok(None)` when nothing is stored.
    pub fn try_load(&self) -> Result<Option<Session>> {
        let Some(raw) = self.store.get(&self.key)? else {
            return Ok(None);
        };
        let session: Session = serde_json::from_str(&raw).map_err(|err| {
            Error::serialization("persisted session is not valid", Some(Box::new(err)))
        })?;
        if !session.has_valid_id() {
            return Err(Error::validation(
                format!("persisted session id {:?} is not a UUID", session.session_id),
                Some("sessionId".to_string()),
            ));
        }
        Ok(Some(session))
    }

    /// Writes the session, keeping only the most recent messages.  Errors are logged.
    pub fn save(&self, session: &Session) {
        if let Err(err) = self.try_save(session) {
            SESSION_PERSIST_ERRORS.click();
            error!(error = %err, "failed to persist session");
        }
    }

    /// Writes the session, keeping only the most recent messages.
    pub fn try_save(&self, session: &Session) -> Result<()> {
        let capped = session.capped(self.max_messages);
        let json = serde_json::to_string(&capped)?;
        self.store.set(&self.key, &json)
    }
}
