//! Output rendering for the chat application.
//!
//! This module provides a trait-based rendering abstraction.  The default
//! implementation writes plain text with optional ANSI styling: resolved citation
//! markers are highlighted and failures are shown in red.

use std::io::{self, Write};

use crate::citations::{self, Segment};
use crate::notice::ErrorNotice;
use crate::types::{Citation, Message};

/// ANSI escape code for dim text (used for prompts and source lists).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for bold text (used for notice titles).
const ANSI_BOLD: &str = "\x1b[1m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for citation markers).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for yellow text (used for the selected passage).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// Trait for rendering chat output.
///
/// This abstraction allows for different rendering strategies:
/// - Plain text with ANSI styling
/// - Plain text without styling (for piping/redirecting)
pub trait Renderer: Send {
    /// Print a chunk of answer text as it streams in.
    fn print_chunk(&mut self, text: &str);

    /// Called when an answer is complete.
    ///
    /// Ends the streamed line and lists the sources the answer cites.
    fn finish_answer(&mut self, message: &Message);

    /// Print a whole message, e.g. when replaying a restored conversation.
    fn print_message(&mut self, message: &Message);

    /// Print the passage attached to the next question.
    fn print_selection(&mut self, text: &str);

    /// Print what the user should know about a failure.
    fn print_notice(&mut self, notice: &ErrorNotice);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Called when the answer is cancelled by the user.
    fn print_interrupted(&mut self);
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    out: Box<dyn Write + Send>,
    use_color: bool,
    line_start: bool,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer writing to stdout with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer writing to stdout with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self::with_writer(Box::new(io::stdout()), use_color)
    }

    /// Creates a renderer writing to `out`.
    pub fn with_writer(out: Box<dyn Write + Send>, use_color: bool) -> Self {
        Self {
            out,
            use_color,
            line_start: true,
        }
    }

    fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
        self.line_start = text.ends_with('\n');
    }

    fn styled(&self, style: &str, text: &str) -> String {
        if self.use_color {
            format!("{style}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }

    fn end_line(&mut self) {
        if !self.line_start {
            self.write("\n");
        }
    }

    /// Renders answer text with resolved markers highlighted.
    fn highlight(&self, content: &str, citations: &[Citation]) -> String {
        let mut rendered = String::with_capacity(content.len());
        for segment in citations::segments(content, citations) {
            match segment {
                Segment::Text(text) => rendered.push_str(text),
                Segment::Citation { marker, .. } => {
                    rendered.push_str(&self.styled(ANSI_CYAN, &format!("[{marker}]")));
                }
            }
        }
        rendered
    }

    fn write_sources(&mut self, citations: &[Citation]) {
        if citations.is_empty() {
            return;
        }
        self.write(&self.styled(ANSI_DIM, "Sources:"));
        self.write("\n");
        for citation in citations {
            let mut line = format!("  [{}] {}", citation.text, citation.chapter);
            if let Some(section) = &citation.section {
                line.push_str(&format!(" / {section}"));
            }
            line.push_str(&format!(" ({})", citation.url));
            self.write(&self.styled(ANSI_DIM, &line));
            self.write("\n");
        }
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn print_chunk(&mut self, text: &str) {
        self.write(text);
    }

    fn finish_answer(&mut self, message: &Message) {
        self.end_line();
        self.write_sources(&message.citations);
    }

    fn print_message(&mut self, message: &Message) {
        self.end_line();
        if message.is_user() {
            self.write(&self.styled(ANSI_DIM, &format!("> {}", message.content)));
            self.write("\n");
        } else {
            let text = self.highlight(&message.content, &message.citations);
            self.write(&text);
            self.write("\n");
            self.write_sources(&message.citations);
        }
    }

    fn print_selection(&mut self, text: &str) {
        self.end_line();
        self.write(&self.styled(ANSI_YELLOW, &format!("[selected] {text}")));
        self.write("\n");
    }

    fn print_notice(&mut self, notice: &ErrorNotice) {
        self.end_line();
        let title = if self.use_color {
            format!("{ANSI_BOLD}{ANSI_RED}{}{ANSI_RESET}", notice.title)
        } else {
            notice.title.to_string()
        };
        self.write(&format!("{title}: {}\n", notice.message));
        if notice.retryable {
            self.write(&self.styled(ANSI_DIM, "Type /retry to ask again."));
            self.write("\n");
        }
    }

    fn print_error(&mut self, error: &str) {
        self.end_line();
        self.write(&format!("{}\n", self.styled(ANSI_RED, &format!("Error: {error}"))));
    }

    fn print_info(&mut self, info: &str) {
        self.end_line();
        self.write(&format!("{info}\n"));
    }

    fn print_interrupted(&mut self) {
        self.end_line();
        self.write("[interrupted]\n");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn renderer(use_color: bool) -> (PlainTextRenderer, Captured) {
        let captured = Captured::default();
        (
            PlainTextRenderer::with_writer(Box::new(captured.clone()), use_color),
            captured,
        )
    }

    fn answer() -> Message {
        Message::assistant(
            "Forward kinematics [Chapter 3, Section 2] maps angles to poses [Chapter 9].",
            vec![Citation::new(
                "Chapter 3, Section 2",
                "Kinematics",
                Some("Forward Kinematics".to_string()),
                "/docs/chapter-3#section-2",
            )],
        )
    }

    #[test]
    fn renderer_default_has_color() {
        let renderer = PlainTextRenderer::new();
        assert!(renderer.use_color);
    }

    #[test]
    fn renderer_without_color() {
        let renderer = PlainTextRenderer::with_color(false);
        assert!(!renderer.use_color);
    }

    #[test]
    fn streamed_answer_ends_with_sources() {
        let (mut renderer, captured) = renderer(false);
        renderer.print_chunk("Forward kinematics ");
        renderer.print_chunk("maps angles to poses.");
        renderer.finish_answer(&answer());
        assert_eq!(
            captured.text(),
            "Forward kinematics maps angles to poses.\nSources:\n  [Chapter 3, Section 2] Kinematics / Forward Kinematics (/docs/chapter-3#section-2)\n"
        );
    }

    #[test]
    fn resolved_markers_are_highlighted() {
        let (mut renderer, captured) = renderer(true);
        renderer.print_message(&answer());
        let text = captured.text();
        assert!(text.contains(&format!("{ANSI_CYAN}[Chapter 3, Section 2]{ANSI_RESET}")));
        assert!(text.contains("poses [Chapter 9]."));
        assert!(!text.contains(&format!("{ANSI_CYAN}[Chapter 9]")));
    }

    #[test]
    fn notice_offers_retry_when_retryable() {
        let (mut renderer, captured) = renderer(false);
        renderer.print_chunk("partial");
        renderer.print_notice(&ErrorNotice::for_kind(crate::error::ErrorKind::Network, 0));
        let text = captured.text();
        assert!(text.starts_with("partial\nConnection Issue: "));
        assert!(text.ends_with("Type /retry to ask again.\n"));

        let (mut renderer, captured) = self::renderer(false);
        renderer.print_notice(&ErrorNotice::rate_limited(12));
        assert!(!captured.text().contains("/retry"));
    }
}
