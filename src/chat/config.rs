//! Configuration types for the chat application.
//!
//! This module provides CLI argument parsing via `arrrg` and the resolved
//! configuration, which may also be loaded from a YAML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::RateLimitConfig;
use crate::selection::SelectionConfig;
use crate::session_store::MAX_PERSISTED_MESSAGES;

/// Default number of prior messages sent as conversation context.
pub const DEFAULT_HISTORY_CONTEXT: usize = 10;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Directory name used under the platform data directory.
const STATE_DIR_NAME: &str = "lectern";

/// Command-line arguments for the lectern-chat tool.
#[derive(CommandLine, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Backend base URL.
    #[arrrg(optional, "Backend URL (default: $LECTERN_API_URL or http://localhost:8000)", "URL")]
    pub api_url: Option<String>,

    /// Directory holding the persisted session and rate-limit window.
    #[arrrg(optional, "Directory for saved session state", "DIR")]
    pub state_dir: Option<String>,

    /// Request timeout in seconds.
    #[arrrg(optional, "Request timeout in seconds (default: 60)", "SECS")]
    pub timeout: Option<u32>,

    /// YAML configuration file.
    #[arrrg(optional, "YAML configuration file", "FILE")]
    pub config: Option<String>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

/// Configuration for a chat session.
///
/// Every field has a default, so a YAML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Backend base URL; `None` defers to the environment.
    pub api_url: Option<String>,

    /// Directory for persisted state; `None` uses the platform data directory.
    pub state_dir: Option<PathBuf>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// How many prior messages accompany each question.
    pub history_context_messages: usize,

    /// How many messages are kept when the session is saved.
    pub max_persisted_messages: usize,

    /// Client-side rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Text selection bounds and debounce.
    pub selection: SelectionConfig,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Timeout: 60 seconds
    /// - History context: 10 messages
    /// - Persisted history: 50 messages
    /// - Rate limit: 10 queries per 60 seconds
    /// - Color: enabled
    pub fn new() -> Self {
        Self {
            api_url: None,
            state_dir: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            history_context_messages: DEFAULT_HISTORY_CONTEXT,
            max_persisted_messages: MAX_PERSISTED_MESSAGES,
            rate_limit: RateLimitConfig::default(),
            selection: SelectionConfig::default(),
            use_color: true,
        }
    }

    /// Loads a configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::io(format!("failed to read {}", path.display()), err))?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Resolves the configuration for `args`: the file named by `--config` if any,
    /// then the remaining flags on top.
    pub fn load(args: &ChatArgs) -> Result<Self> {
        let base = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::new(),
        };
        Ok(base.apply_args(args))
    }

    /// Overrides fields with those given on the command line.
    pub fn apply_args(mut self, args: &ChatArgs) -> Self {
        if let Some(url) = &args.api_url {
            self.api_url = Some(url.clone());
        }
        if let Some(dir) = &args.state_dir {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = args.timeout {
            self.timeout_secs = u64::from(timeout);
        }
        if args.no_color {
            self.use_color = false;
        }
        self
    }

    /// Sets the backend URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Sets the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Sets how many prior messages accompany each question.
    pub fn with_history_context(mut self, messages: usize) -> Self {
        self.history_context_messages = messages;
        self
    }

    /// Sets how many messages are persisted.
    pub fn with_max_persisted_messages(mut self, messages: usize) -> Self {
        self.max_persisted_messages = messages;
        self
    }

    /// Sets the rate limit.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Sets the selection policy.
    pub fn with_selection(mut self, selection: SelectionConfig) -> Self {
        self.selection = selection;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Returns the request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Returns the directory persisted state lives in.
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|dir| dir.join(STATE_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{STATE_DIR_NAME}")))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ChatArgs> for ChatConfig {
    fn from(args: ChatArgs) -> Self {
        ChatConfig::new().apply_args(&args)
    }
}
