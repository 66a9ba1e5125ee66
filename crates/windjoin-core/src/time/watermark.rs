//! # Watermark Generation and Tracking
//!
//! - [`BoundedLatenessGenerator`]: `watermark = max(event time seen) - lateness`,
//!   one per input stream
//! - [`WatermarkTracker`]: minimum over several inputs, used by the window join
//!   to decide when both sides of a window are complete
//!
//! Watermarks never regress. A generator that has seen no events reports
//! `i64::MIN`.

use std::time::Duration;

use super::Watermark;

/// Produces a watermark from observed event timestamps.
pub trait WatermarkGenerator: Send {
    /// Observes one event timestamp.
    ///
    /// Returns `Some(watermark)` if the watermark advanced.
    fn on_event(&mut self, timestamp: i64) -> Option<Watermark>;

    /// Returns the current watermark without advancing it.
    fn current_watermark(&self) -> i64;

    /// Returns the largest event timestamp observed so far.
    fn max_timestamp(&self) -> i64;

    /// Advances the watermark to at least `timestamp`.
    ///
    /// Returns `Some(watermark)` if it advanced. Used to flush all windows at
    /// end of input.
    fn advance_watermark(&mut self, timestamp: i64) -> Option<Watermark>;

    /// Restores generator progress from a checkpoint.
    fn restore(&mut self, max_timestamp: i64, watermark: i64);
}

/// Watermark generator with a fixed lateness bound.
///
/// ```rust
/// use windjoin_core::time::{BoundedLatenessGenerator, WatermarkGenerator, Watermark};
///
/// let mut generator = BoundedLatenessGenerator::new(100);
/// assert_eq!(generator.on_event(1000), Some(Watermark::new(900)));
/// assert_eq!(generator.on_event(800), None);
/// assert_eq!(generator.on_event(1200), Some(Watermark::new(1100)));
/// ```
#[derive(Debug, Clone)]
pub struct BoundedLatenessGenerator {
    lateness: i64,
    max_timestamp: i64,
    watermark: i64,
}

impl BoundedLatenessGenerator {
    /// Creates a generator allowing rows to be `lateness` ms out of order.
    ///
    /// Negative values are treated as zero.
    #[must_use]
    pub fn new(lateness: i64) -> Self {
        Self {
            lateness: lateness.max(0),
            max_timestamp: i64::MIN,
            watermark: i64::MIN,
        }
    }

    /// Creates a generator from a `Duration`.
    #[must_use]
    pub fn from_duration(lateness: Duration) -> Self {
        Self::new(i64::try_from(lateness.as_millis()).unwrap_or(i64::MAX))
    }

    /// Returns the lateness bound in milliseconds.
    #[must_use]
    pub fn lateness(&self) -> i64 {
        self.lateness
    }
}

impl WatermarkGenerator for BoundedLatenessGenerator {
    #[inline]
    fn on_event(&mut self, timestamp: i64) -> Option<Watermark> {
        if timestamp <= self.max_timestamp {
            return None;
        }
        self.max_timestamp = timestamp;
        let candidate = timestamp.saturating_sub(self.lateness);
        if candidate > self.watermark {
            self.watermark = candidate;
            Some(Watermark::new(candidate))
        } else {
            None
        }
    }

    #[inline]
    fn current_watermark(&self) -> i64 {
        self.watermark
    }

    #[inline]
    fn max_timestamp(&self) -> i64 {
        self.max_timestamp
    }

    fn advance_watermark(&mut self, timestamp: i64) -> Option<Watermark> {
        if timestamp <= self.watermark {
            return None;
        }
        self.watermark = timestamp;
        // keep max_timestamp >= watermark + lateness
        let implied_max = timestamp.saturating_add(self.lateness);
        if implied_max > self.max_timestamp {
            self.max_timestamp = implied_max;
        }
        Some(Watermark::new(timestamp))
    }

    fn restore(&mut self, max_timestamp: i64, watermark: i64) {
        self.max_timestamp = max_timestamp;
        self.watermark = watermark;
    }
}

/// Tracks the minimum watermark across a fixed number of inputs.
///
/// ```rust
/// use windjoin_core::time::{Watermark, WatermarkTracker};
///
/// let mut tracker = WatermarkTracker::new(2);
/// assert_eq!(tracker.update_source(0, 1000), None); // input 1 still at MIN
/// assert_eq!(tracker.update_source(1, 500), Some(Watermark::new(500)));
/// ```
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    source_watermarks: Vec<i64>,
    combined_watermark: i64,
}

impl WatermarkTracker {
    /// Creates a tracker for `num_sources` inputs.
    #[must_use]
    pub fn new(num_sources: usize) -> Self {
        Self {
            source_watermarks: vec![i64::MIN; num_sources],
            combined_watermark: i64::MIN,
        }
    }

    /// Updates one input's watermark.
    ///
    /// Stale updates are ignored. Returns `Some` if the combined watermark
    /// advanced.
    pub fn update_source(&mut self, source_id: usize, watermark: i64) -> Option<Watermark> {
        let slot = self.source_watermarks.get_mut(source_id)?;
        if watermark <= *slot {
            return None;
        }
        *slot = watermark;
        self.update_combined()
    }

    /// Returns the combined watermark, `None` until every input has one.
    #[must_use]
    pub fn current_watermark(&self) -> Option<Watermark> {
        let combined = Watermark::new(self.combined_watermark);
        (!combined.is_initial()).then_some(combined)
    }

    /// Returns the watermark of one input.
    #[must_use]
    pub fn source_watermark(&self, source_id: usize) -> Option<i64> {
        self.source_watermarks.get(source_id).copied()
    }

    /// Returns the number of tracked inputs.
    #[must_use]
    pub fn num_sources(&self) -> usize {
        self.source_watermarks.len()
    }

    /// Restores per-input watermarks from a checkpoint.
    pub fn restore(&mut self, watermarks: &[i64]) {
        for (slot, wm) in self.source_watermarks.iter_mut().zip(watermarks) {
            *slot = *wm;
        }
        self.combined_watermark = self
            .source_watermarks
            .iter()
            .copied()
            .min()
            .unwrap_or(i64::MIN);
    }

    fn update_combined(&mut self) -> Option<Watermark> {
        let min = self
            .source_watermarks
            .iter()
            .copied()
            .min()
            .unwrap_or(i64::MIN);
        if min > self.combined_watermark {
            self.combined_watermark = min;
            Some(Watermark::new(min))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_is_max_minus_lateness() {
        let mut generator = BoundedLatenessGenerator::new(2000);
        assert_eq!(generator.on_event(5000), Some(Watermark::new(3000)));
        assert_eq!(generator.on_event(9000), Some(Watermark::new(7000)));
        assert_eq!(generator.current_watermark(), 7000);
        assert_eq!(generator.max_timestamp(), 9000);
    }

    #[test]
    fn test_watermark_never_regresses() {
        let mut generator = BoundedLatenessGenerator::new(0);
        generator.on_event(10_000);
        assert_eq!(generator.on_event(2_000), None);
        assert_eq!(generator.on_event(10_000), None);
        assert_eq!(generator.current_watermark(), 10_000);
    }

    #[test]
    fn test_negative_lateness_is_clamped() {
        let generator = BoundedLatenessGenerator::new(-5);
        assert_eq!(generator.lateness(), 0);
        let from_duration = BoundedLatenessGenerator::from_duration(Duration::from_secs(3));
        assert_eq!(from_duration.lateness(), 3000);
    }

    #[test]
    fn test_advance_to_end_of_input() {
        let mut generator = BoundedLatenessGenerator::new(1000);
        generator.on_event(4000);
        assert_eq!(
            generator.advance_watermark(i64::MAX),
            Some(Watermark::END_OF_INPUT)
        );
        assert_eq!(generator.advance_watermark(5), None);
        assert_eq!(generator.on_event(i64::MAX - 1), None);
    }

    #[test]
    fn test_generator_restore() {
        let mut generator = BoundedLatenessGenerator::new(100);
        generator.restore(5000, 4900);
        assert_eq!(generator.on_event(4000), None);
        assert_eq!(generator.on_event(6000), Some(Watermark::new(5900)));
    }

    #[test]
    fn test_tracker_minimum_of_two_inputs() {
        let mut tracker = WatermarkTracker::new(2);
        assert_eq!(tracker.update_source(0, 10_000), None);
        assert_eq!(tracker.current_watermark(), None);
        assert_eq!(tracker.update_source(1, 4_000), Some(Watermark::new(4_000)));
        assert_eq!(tracker.update_source(1, 12_000), Some(Watermark::new(10_000)));
        assert_eq!(tracker.update_source(1, 11_000), None);
        assert_eq!(tracker.source_watermark(1), Some(12_000));
        assert_eq!(tracker.update_source(7, 1), None);
    }

    #[test]
    fn test_tracker_restore() {
        let mut tracker = WatermarkTracker::new(2);
        tracker.restore(&[3000, 8000]);
        assert_eq!(tracker.current_watermark(), Some(Watermark::new(3000)));
        assert_eq!(tracker.update_source(0, 9000), Some(Watermark::new(8000)));
    }
}
