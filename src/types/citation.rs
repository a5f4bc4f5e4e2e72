use serde::{Deserialize, Serialize};

/// A pointer from assistant text to a location in the textbook.
///
/// Citations are produced by the backend while an answer streams.  The `text` field
/// (e.g. `"Chapter 3, Section 2"`) is what bracketed markers in the answer refer to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Display text, matched against `[...]` markers in the answer.
    pub text: String,

    /// Chapter title or label.
    pub chapter: String,

    /// Section title, if the citation is narrower than a chapter.
    #[serde(default)]
    pub section: Option<String>,

    /// Link to the cited page, e.g. `/docs/chapter-3#section-2`.
    pub url: String,

    /// Numeric chapter, when the backend supplies it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_number: Option<u32>,

    /// Numeric section, when the backend supplies it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_number: Option<u32>,

    /// Heading of the cited passage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
}

impl Citation {
    /// Creates a citation without the optional numeric metadata.
    pub fn new(
        text: impl Into<String>,
        chapter: impl Into<String>,
        section: Option<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            chapter: chapter.into(),
            section,
            url: url.into(),
            chapter_number: None,
            section_number: None,
            heading: None,
        }
    }

    /// Returns true if a marker's inner text refers to this citation.
    ///
    /// Matching is exact apart from letter case.
    pub fn matches_marker(&self, marker: &str) -> bool {
        self.text.to_lowercase() == marker.to_lowercase()
    }
}
