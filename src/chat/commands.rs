//! Slash command parsing for the chat application.
//!
//! This module handles parsing of special commands that start with `/`,
//! allowing users to control the chat session without sending a question
//! to the backend.

/// A parsed chat command.
///
/// These commands control the chat session and are not sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// Discard the conversation and start a new session.
    Clear,

    /// Ask the most recent question again.
    Retry,

    /// Attach a passage to the next question.
    Select(String),

    /// Detach the passage.
    Unselect,

    /// Check backend health.
    Health,

    /// Display session statistics.
    Stats,

    /// Display the rate-limit window.
    Limits,

    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a valid command,
/// or `None` if it should be treated as a question.
///
/// # Examples
///
/// ```
/// # use lectern::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/select Inverse kinematics solves for joint angles").is_some());
/// assert!(parse_command("What is SLAM?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "clear" | "new" => ChatCommand::Clear,
        "retry" | "r" => ChatCommand::Retry,
        "select" => match argument {
            Some(text) => ChatCommand::Select(text.to_string()),
            None => ChatCommand::Invalid("/select requires the passage text".to_string()),
        },
        "unselect" => ChatCommand::Unselect,
        "health" => ChatCommand::Health,
        "stats" | "status" => ChatCommand::Stats,
        "limits" | "limit" => ChatCommand::Limits,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        _ => ChatCommand::Invalid(format!("Unknown command: /{command}")),
    };

    Some(result)
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /clear                 Start a new conversation
  /retry                 Ask the last question again
  /select <text>         Ask the next question about a passage
  /unselect              Drop the selected passage
  /health                Check the backend
  /stats                 Show session statistics and metrics
  /limits                Show the query rate limit
  /help                  Show this help message
  /quit                  Exit the chat
Press Ctrl-C while an answer streams to cancel it."#
}
