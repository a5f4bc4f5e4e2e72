//! Text selection monitoring.
//!
//! A [`SelectionMonitor`] is told when the user may have changed their selection
//! (pointer release, key release, touch end).  After the input has been quiet for
//! the debounce interval it reads the current selection from a [`SelectionSource`],
//! applies the length policy and publishes the result.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::observability::SELECTION_EVALUATIONS;

/// Selections shorter than this many characters are ignored.
pub const MIN_SELECTION_LENGTH: usize = 10;

/// Selections longer than this many characters are truncated.
pub const MAX_SELECTION_LENGTH: usize = 5000;

/// Quiet period before a selection is evaluated, in milliseconds.
pub const DEBOUNCE_MILLIS: u64 = 300;

/// Length bounds and debounce for selection monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Minimum selection length in characters.
    pub min_length: usize,
    /// Maximum selection length in characters.
    pub max_length: usize,
    /// Debounce in milliseconds.
    pub debounce_millis: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_length: MIN_SELECTION_LENGTH,
            max_length: MAX_SELECTION_LENGTH,
            debounce_millis: DEBOUNCE_MILLIS,
        }
    }
}

impl SelectionConfig {
    /// Returns the debounce interval.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }
}

/// A rectangle in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionRect {
    pub top: f64,
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub width: f64,
    pub height: f64,
}

impl SelectionRect {
    /// Shifts a viewport-relative rectangle by the scroll offset.
    pub fn to_document(self, scroll_x: f64, scroll_y: f64) -> Self {
        Self {
            top: self.top + scroll_y,
            left: self.left + scroll_x,
            right: self.right + scroll_x,
            bottom: self.bottom + scroll_y,
            width: self.width,
            height: self.height,
        }
    }
}

/// Where the current selection comes from.
///
/// Implemented by whatever owns the document being read: a terminal pager, an
/// editor integration, or a fake in tests.
pub trait SelectionSource: Send + Sync {
    /// Returns the raw selected text, if any.
    fn selected_text(&self) -> Option<String>;

    /// Returns the viewport-relative bounding box of the first selected range.
    fn first_range_rect(&self) -> Option<SelectionRect>;

    /// Returns the `(x, y)` scroll offset of the viewport.
    fn scroll_offset(&self) -> (f64, f64) {
        (0.0, 0.0)
    }

    /// Deselects everything.
    fn remove_all_ranges(&self);
}

/// The input event that may have changed the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTrigger {
    PointerUp,
    KeyUp,
    TouchEnd,
}

/// The published selection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectionState {
    /// Selected text, trimmed and bounded; empty when there is no selection.
    pub text: String,
    /// Document-coordinate bounding box of the selection.
    pub position: Option<SelectionRect>,
    /// True if `text` was cut to the maximum length.
    pub truncated: bool,
}

impl SelectionState {
    /// Returns true if a usable selection is present.
    pub fn has_selection(&self) -> bool {
        !self.text.is_empty()
    }
}

/// Applies the length policy to the source's current selection.
pub fn evaluate_selection(source: &dyn SelectionSource, config: &SelectionConfig) -> SelectionState {
    SELECTION_EVALUATIONS.click();
    let raw = source.selected_text().unwrap_or_default();
    let text = raw.trim();
    let length = text.chars().count();
    if length < config.min_length {
        return SelectionState::default();
    }
    let (text, truncated) = if length > config.max_length {
        (text.chars().take(config.max_length).collect(), true)
    } else {
        (text.to_string(), false)
    };
    let (scroll_x, scroll_y) = source.scroll_offset();
    let position = source
        .first_range_rect()
        .map(|rect| rect.to_document(scroll_x, scroll_y));
    SelectionState {
        text,
        position,
        truncated,
    }
}

/// Debounced selection tracker.
///
/// Dropping the monitor cancels any pending evaluation.
pub struct SelectionMonitor {
    source: Arc<dyn SelectionSource>,
    config: SelectionConfig,
    state: Arc<watch::Sender<SelectionState>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl SelectionMonitor {
    /// Creates a monitor over `source`.
    pub fn new(source: Arc<dyn SelectionSource>, config: SelectionConfig) -> Self {
        let (state, _) = watch::channel(SelectionState::default());
        Self {
            source,
            config,
            state: Arc::new(state),
            pending: Mutex::new(None),
        }
    }

    /// Reports an input event.  Evaluation happens once input has been quiet for the
    /// debounce interval; each new trigger restarts the wait.
    ///
    /// Must be called from within a tokio runtime.
    pub fn notify(&self, trigger: SelectionTrigger) {
        debug!(?trigger, "selection trigger");
        let source = Arc::clone(&self.source);
        let state = Arc::clone(&self.state);
        let config = self.config;
        let task = tokio::spawn(async move {
            tokio::time::sleep(config.debounce()).await;
            let next = evaluate_selection(source.as_ref(), &config);
            state.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        });
        if let Some(previous) = self.pending().replace(task) {
            previous.abort();
        }
    }

    /// Clears the published selection and the source's own selection.
    pub fn clear_selection(&self) {
        if let Some(pending) = self.pending().take() {
            pending.abort();
        }
        self.state.send_replace(SelectionState::default());
        self.source.remove_all_ranges();
    }

    /// Returns the current selection.
    pub fn state(&self) -> SelectionState {
        self.state.borrow().clone()
    }

    /// Subscribes to selection changes.
    pub fn subscribe(&self) -> watch::Receiver<SelectionState> {
        self.state.subscribe()
    }

    fn pending(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SelectionMonitor {
    fn drop(&mut self) {
        if let Some(pending) = self.pending().take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeSelection {
        text: Mutex<Option<String>>,
        rect: Option<SelectionRect>,
        scroll: (f64, f64),
        reads: Mutex<usize>,
        cleared: Mutex<bool>,
    }

    impl FakeSelection {
        fn with_text(text: &str) -> Self {
            Self {
                text: Mutex::new(Some(text.to_string())),
                ..Self::default()
            }
        }

        fn select(&self, text: &str) {
            *self.text.lock().unwrap() = Some(text.to_string());
        }

        fn reads(&self) -> usize {
            *self.reads.lock().unwrap()
        }
    }

    impl SelectionSource for FakeSelection {
        fn selected_text(&self) -> Option<String> {
            *self.reads.lock().unwrap() += 1;
            self.text.lock().unwrap().clone()
        }

        fn first_range_rect(&self) -> Option<SelectionRect> {
            self.rect
        }

        fn scroll_offset(&self) -> (f64, f64) {
            self.scroll
        }

        fn remove_all_ranges(&self) {
            *self.text.lock().unwrap() = None;
            *self.cleared.lock().unwrap() = true;
        }
    }

    #[test]
    fn long_selection_is_truncated() {
        let source = FakeSelection::with_text(&"a".repeat(6000));
        let state = evaluate_selection(&source, &SelectionConfig::default());
        assert_eq!(state.text.chars().count(), 5000);
        assert!(state.truncated);
        assert!(state.has_selection());
    }

    #[test]
    fn short_selection_is_no_selection() {
        let source = FakeSelection::with_text("short");
        let state = evaluate_selection(&source, &SelectionConfig::default());
        assert!(!state.has_selection());
        assert!(!state.truncated);
        assert_eq!(state.position, None);
    }

    #[test]
    fn whitespace_is_trimmed_before_measuring() {
        let source = FakeSelection::with_text("   tiny    \n\n\n   ");
        assert!(!evaluate_selection(&source, &SelectionConfig::default()).has_selection());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let source = FakeSelection::with_text(&"é".repeat(5001));
        let state = evaluate_selection(&source, &SelectionConfig::default());
        assert_eq!(state.text.chars().count(), 5000);
        assert!(state.truncated);
    }

    #[test]
    fn position_is_in_document_coordinates() {
        let source = FakeSelection {
            text: Mutex::new(Some("Inverse kinematics solves for joint angles".into())),
            rect: Some(SelectionRect {
                top: 10.0,
                left: 20.0,
                right: 120.0,
                bottom: 30.0,
                width: 100.0,
                height: 20.0,
            }),
            scroll: (5.0, 400.0),
            ..FakeSelection::default()
        };
        let state = evaluate_selection(&source, &SelectionConfig::default());
        let rect = state.position.unwrap();
        assert_eq!(rect.top, 410.0);
        assert_eq!(rect.left, 25.0);
        assert_eq!(rect.right, 125.0);
        assert_eq!(rect.bottom, 430.0);
        assert_eq!(rect.width, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_are_coalesced() {
        let source = Arc::new(FakeSelection::with_text("Forward kinematics"));
        let monitor = SelectionMonitor::new(source.clone(), SelectionConfig::default());
        let mut changes = monitor.subscribe();

        for _ in 0..5 {
            monitor.notify(SelectionTrigger::KeyUp);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(source.reads(), 0);

        source.select("Forward kinematics maps joints to poses");
        changes.changed().await.unwrap();
        assert_eq!(source.reads(), 1);
        assert_eq!(
            monitor.state().text,
            "Forward kinematics maps joints to poses"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_selection_cancels_pending_and_deselects() {
        let source = Arc::new(FakeSelection::with_text("Localization and mapping"));
        let monitor = SelectionMonitor::new(source.clone(), SelectionConfig::default());
        monitor.notify(SelectionTrigger::PointerUp);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(monitor.state().has_selection());

        source.select("Localization and mapping, again");
        monitor.notify(SelectionTrigger::TouchEnd);
        monitor.clear_selection();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!monitor.state().has_selection());
        assert!(*source.cleared.lock().unwrap());
        assert_eq!(source.reads(), 1);
    }
}
