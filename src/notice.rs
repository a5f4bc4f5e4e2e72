//! User-facing descriptions of failures.

use std::fmt;

use crate::error::{Error, ErrorKind};

/// What to tell the user about a failed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    /// Classification the notice was chosen by.
    pub kind: ErrorKind,
    /// Short heading.
    pub title: &'static str,
    /// Full explanation.
    pub message: String,
    /// True if offering a retry makes sense.
    pub retryable: bool,
}

impl ErrorNotice {
    /// Builds the notice for `kind`.  `wait_seconds` fills in the rate-limit message.
    pub fn for_kind(kind: ErrorKind, wait_seconds: u64) -> Self {
        let (title, message, retryable) = match kind {
            ErrorKind::Network => (
                "Connection Issue",
                "Unable to reach the chatbot service. Please check your internet connection and try again.".to_string(),
                true,
            ),
            ErrorKind::RateLimit => (
                "Query Limit Reached",
                format!(
                    "You've asked too many questions recently. Please wait {wait_seconds} seconds before trying again."
                ),
                false,
            ),
            ErrorKind::Timeout => (
                "Request Timed Out",
                "The chatbot is taking longer than usual. Please try again or simplify your question.".to_string(),
                true,
            ),
            ErrorKind::ServiceUnavailable => (
                "Chatbot Temporarily Unavailable",
                "The chatbot service is currently down. Please try again in a few moments.".to_string(),
                true,
            ),
            ErrorKind::NoResults => (
                "No Information Found",
                "I couldn't find information about this in the textbook. Try rephrasing your question or asking about a different topic.".to_string(),
                false,
            ),
            ErrorKind::InvalidInput => (
                "Invalid Question",
                "Your question is too long (max 2000 characters) or empty. Please try a shorter question.".to_string(),
                false,
            ),
            ErrorKind::Unknown => (
                "Something Went Wrong",
                "An unexpected error occurred. Please try again later or contact support if the issue persists.".to_string(),
                true,
            ),
        };
        Self {
            kind,
            title,
            message,
            retryable,
        }
    }

    /// Builds the notice for `error`.
    ///
    /// For rate-limit errors the wait falls back to the error's own `retry_after`
    /// when `wait_seconds` is zero.
    pub fn for_error(error: &Error, wait_seconds: u64) -> Self {
        let kind = error.kind();
        let wait = if wait_seconds == 0 {
            error.retry_after().unwrap_or(0)
        } else {
            wait_seconds
        };
        Self::for_kind(kind, wait)
    }

    /// The notice shown when the local rate limiter refuses a query.
    pub fn rate_limited(wait_seconds: u64) -> Self {
        Self::for_kind(ErrorKind::RateLimit, wait_seconds)
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_message_embeds_wait() {
        let notice = ErrorNotice::rate_limited(42);
        assert_eq!(notice.title, "Query Limit Reached");
        assert!(notice.message.contains("wait 42 seconds"));
        assert!(!notice.retryable);
    }

    #[test]
    fn wait_falls_back_to_retry_after() {
        let notice = ErrorNotice::for_error(&Error::rate_limit("Too many requests", Some(17)), 0);
        assert!(notice.message.contains("wait 17 seconds"));
    }

    #[test]
    fn retry_affordance_follows_kind() {
        let network = ErrorNotice::for_error(&Error::connection("Failed to fetch", None), 0);
        assert_eq!(network.kind, ErrorKind::Network);
        assert!(network.retryable);

        let empty = ErrorNotice::for_error(&Error::backend("No results for query", None), 0);
        assert_eq!(empty.kind, ErrorKind::NoResults);
        assert!(!empty.retryable);

        let odd = ErrorNotice::for_error(&Error::backend("Unknown error", None), 0);
        assert_eq!(odd.title, "Something Went Wrong");
        assert!(odd.retryable);
    }
}
