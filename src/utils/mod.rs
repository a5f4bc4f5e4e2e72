//! Small shared helpers.

pub mod clock;
pub mod time;

pub use clock::{Clock, ManualClock, SystemClock};
