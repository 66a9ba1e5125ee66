//! # Time Module
//!
//! Event time, watermarks and window-close timers.
//!
//! ## Concepts
//!
//! - **Event Time**: millisecond timestamp derived from a row by the [`TimeAssigner`]
//! - **Watermark**: per-stream assertion that no row with event time at or
//!   before the watermark will still arrive
//! - **Timer**: event-time callback used to close a window once the watermark
//!   reaches its end
//!
//! ## Watermarks
//!
//! Each input stream owns a [`BoundedLatenessGenerator`]:
//!
//! ```rust
//! use windjoin_core::time::{BoundedLatenessGenerator, WatermarkGenerator, Watermark};
//!
//! // Rows may arrive up to 1 second out of order
//! let mut generator = BoundedLatenessGenerator::new(1000);
//! assert_eq!(generator.on_event(5000), Some(Watermark::new(4000)));
//! assert_eq!(generator.on_event(4500), None); // never regresses
//! ```
//!
//! A two-input operator combines its inputs with [`WatermarkTracker`]:
//!
//! ```rust
//! use windjoin_core::time::{Watermark, WatermarkTracker};
//!
//! let mut tracker = WatermarkTracker::new(2);
//! tracker.update_source(0, 5000);
//! tracker.update_source(1, 3000);
//! assert_eq!(tracker.current_watermark(), Some(Watermark::new(3000)));
//! ```

mod event_time;
mod watermark;

pub use event_time::{EventTimeError, TimeAssigner, TimeAssignerMetrics, TimeSemantics};
pub use watermark::{BoundedLatenessGenerator, WatermarkGenerator, WatermarkTracker};

use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Timer key sized for a 16-byte window identifier.
pub type TimerKey = SmallVec<[u8; 16]>;

/// Timers fired by a single poll.
pub type FiredTimersVec = SmallVec<[TimerRegistration; 8]>;

/// A watermark: event-time progress of one stream.
///
/// ```rust
/// use windjoin_core::time::Watermark;
///
/// let watermark = Watermark::new(10_000);
/// assert!(watermark.has_reached(10_000)); // a window ending here may close
/// assert!(!watermark.has_reached(10_001));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(pub i64);

impl Watermark {
    /// Watermark of an exhausted input: every window is complete.
    pub const END_OF_INPUT: Watermark = Watermark(i64::MAX);

    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Returns true once the watermark is at or past `timestamp`.
    ///
    /// A window `[start, end)` is complete when `has_reached(end)`.
    #[inline]
    #[must_use]
    pub fn has_reached(&self, timestamp: i64) -> bool {
        self.0 >= timestamp
    }

    /// Returns true if no event has moved the watermark yet.
    #[inline]
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.0 == i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self(i64::MIN)
    }
}

/// A pending event-time timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRegistration {
    /// Unique timer ID
    pub id: u64,
    /// Firing time (event time, milliseconds)
    pub timestamp: i64,
    /// Operator-defined key, typically an encoded window
    pub key: Option<TimerKey>,
}

impl Ord for TimerRegistration {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on timestamp, registration order breaks ties
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerRegistration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Event-time timer queue.
///
/// Window operators register one timer per window at `window.end` and poll
/// the queue with each new watermark. Timers fire in timestamp order, so
/// windows close in `end`-ascending order.
///
/// ```rust
/// use windjoin_core::time::{TimerKey, TimerService};
///
/// let mut service = TimerService::new();
/// service.register_timer(10_000, Some(TimerKey::from_slice(&[2])));
/// service.register_timer(5_000, Some(TimerKey::from_slice(&[1])));
///
/// let fired = service.poll_timers(7_500);
/// assert_eq!(fired.len(), 1);
/// assert_eq!(fired[0].timestamp, 5_000);
/// ```
#[derive(Debug)]
pub struct TimerService {
    timers: BinaryHeap<TimerRegistration>,
    next_timer_id: u64,
}

impl TimerService {
    /// Creates an empty timer service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: BinaryHeap::new(),
            next_timer_id: 0,
        }
    }

    /// Registers a timer and returns its id.
    pub fn register_timer(&mut self, timestamp: i64, key: Option<TimerKey>) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimerRegistration { id, timestamp, key });
        id
    }

    /// Removes and returns every timer with `timestamp <= current_time`,
    /// earliest first.
    #[inline]
    pub fn poll_timers(&mut self, current_time: i64) -> FiredTimersVec {
        let mut fired = FiredTimersVec::new();
        while self
            .timers
            .peek()
            .is_some_and(|timer| timer.timestamp <= current_time)
        {
            if let Some(timer) = self.timers.pop() {
                fired.push(timer);
            }
        }
        fired
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Returns the timestamp of the next timer to fire, if any.
    #[must_use]
    pub fn next_timer_timestamp(&self) -> Option<i64> {
        self.timers.peek().map(|t| t.timestamp)
    }

    /// Clears all pending timers.
    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur in time operations.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// Window size must be positive
    #[error("Invalid window size: {0}ms")]
    InvalidWindowSize(i64),

    /// Lateness must not be negative
    #[error("Invalid lateness: {0}ms")]
    InvalidLateness(i64),

    /// Unknown session time zone
    #[error("Invalid time zone: {0}")]
    InvalidTimeZone(String),

    /// Event time extraction failed for the whole batch
    #[error("Event time error: {0}")]
    EventTime(#[from] EventTimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_window_completion() {
        let watermark = Watermark::new(5000);
        assert!(watermark.has_reached(5000));
        assert!(watermark.has_reached(4999));
        assert!(!watermark.has_reached(5001));
    }

    #[test]
    fn test_initial_and_end_of_input() {
        assert!(Watermark::default().is_initial());
        assert!(!Watermark::default().has_reached(i64::MIN + 1));
        assert!(Watermark::END_OF_INPUT.has_reached(i64::MAX));
        assert!(Watermark::new(0) < Watermark::END_OF_INPUT);
    }

    #[test]
    fn test_timer_poll_order() {
        let mut service = TimerService::new();

        let late = service.register_timer(10_000, Some(TimerKey::from_slice(&[2])));
        let early = service.register_timer(5_000, Some(TimerKey::from_slice(&[1])));
        service.register_timer(15_000, None);

        let fired = service.poll_timers(7_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, early);
        assert_eq!(fired[0].key, Some(TimerKey::from_slice(&[1])));

        let fired = service.poll_timers(10_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, late);

        assert_eq!(service.pending_count(), 1);
        assert_eq!(service.next_timer_timestamp(), Some(15_000));
    }

    #[test]
    fn test_timers_with_equal_timestamps_fire_in_registration_order() {
        let mut service = TimerService::new();
        let first = service.register_timer(100, None);
        let second = service.register_timer(100, None);

        let fired = service.poll_timers(100);
        let ids: Vec<u64> = fired.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn test_clear_drops_window_timers() {
        let mut service = TimerService::new();
        service.register_timer(5_000, Some(TimerKey::from_slice(&[0; 16])));
        service.register_timer(10_000, Some(TimerKey::from_slice(&[1; 16])));

        service.clear();
        assert_eq!(service.pending_count(), 0);
        assert!(service.poll_timers(i64::MAX).is_empty());
    }
}
