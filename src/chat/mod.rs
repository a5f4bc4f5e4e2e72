//! Chat application module for conversations with the textbook assistant.
//!
//! This module provides the session controller and a streaming REPL built on
//! top of the lectern client library. It supports:
//!
//! - Streaming answers with real-time display
//! - Citation highlighting and source lists
//! - Slash commands for session control
//! - Cancellation of an answer in flight
//!
//! # Architecture
//!
//! The module is organized into several components:
//!
//! - [`config`]: CLI argument parsing and configuration
//! - [`controller`]: Conversation state, rate limiting and query orchestration
//! - [`commands`]: Slash command parsing and handling

mod commands;
mod config;
mod controller;

pub use crate::render::{PlainTextRenderer, Renderer};
pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{ChatArgs, ChatConfig, DEFAULT_HISTORY_CONTEXT};
pub use controller::{ChatController, ChatEvent, FALLBACK_RESPONSE, QueryPhase};
