//! Citation markers in answer text.
//!
//! Answers refer to the textbook with bracketed markers such as `[Chapter 3]` or
//! `[Chapter 3, Section 2]`.  A marker resolves to the citation whose `text` equals
//! the marker's inner text, ignoring case.  Markers without a matching citation are
//! left in the text as written.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::Citation;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(Chapter\s+\d+(?:,\s*Section\s+\d+)?)\]").expect("marker pattern is valid")
});

/// A piece of answer text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment<'a> {
    /// Plain text, including any unresolved markers.
    Text(&'a str),
    /// A resolved marker.
    Citation {
        /// The marker's inner text, e.g. `Chapter 3, Section 2`.
        marker: &'a str,
        /// The citation it refers to.
        citation: &'a Citation,
    },
}

/// Returns the inner text of every marker in `content`, in order.
pub fn markers(content: &str) -> Vec<&str> {
    MARKER
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .collect()
}

/// Splits `content` into text and resolved citation segments.
///
/// Adjacent text, including unresolved markers, is kept in a single segment.
pub fn segments<'a>(content: &'a str, citations: &'a [Citation]) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    for caps in MARKER.captures_iter(content) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(citation) = citations.iter().find(|c| c.matches_marker(inner.as_str())) else {
            continue;
        };
        if whole.start() > text_start {
            segments.push(Segment::Text(&content[text_start..whole.start()]));
        }
        segments.push(Segment::Citation {
            marker: inner.as_str(),
            citation,
        });
        text_start = whole.end();
    }
    if text_start < content.len() {
        segments.push(Segment::Text(&content[text_start..]));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinematics() -> Vec<Citation> {
        vec![
            Citation::new(
                "Chapter 3, Section 2",
                "Kinematics",
                Some("Forward Kinematics".to_string()),
                "/docs/chapter-3#section-2",
            ),
            Citation::new("Chapter 5", "Perception", None, "/docs/chapter-5"),
        ]
    }

    #[test]
    fn finds_markers_case_insensitively() {
        let content = "See [Chapter 3, Section 2] and [chapter 5]; not [Appendix A] or [Chapter X].";
        assert_eq!(markers(content), vec!["Chapter 3, Section 2", "chapter 5"]);
    }

    #[test]
    fn resolves_markers_against_citations() {
        let citations = kinematics();
        let content = "Joint angles map to poses [Chapter 3, Section 2]. Cameras help [CHAPTER 5].";
        let segments = segments(content, &citations);
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0], Segment::Text("Joint angles map to poses "));
        match segments[1] {
            Segment::Citation { marker, citation } => {
                assert_eq!(marker, "Chapter 3, Section 2");
                assert_eq!(citation.url, "/docs/chapter-3#section-2");
            }
            other => panic!("expected citation, got {other:?}"),
        }
        assert_eq!(segments[2], Segment::Text(". Cameras help "));
        match segments[3] {
            Segment::Citation { citation, .. } => assert_eq!(citation.chapter, "Perception"),
            other => panic!("expected citation, got {other:?}"),
        }
        assert_eq!(segments[4], Segment::Text("."));
    }

    #[test]
    fn unresolved_markers_stay_in_text() {
        let citations = kinematics();
        let content = "Covered in [Chapter 9] at length.";
        assert_eq!(
            segments(content, &citations),
            vec![Segment::Text("Covered in [Chapter 9] at length.")]
        );
        assert_eq!(segments("", &citations), Vec::<Segment>::new());
    }
}
