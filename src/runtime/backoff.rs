//! # Exponential Backoff
//!
//! Per-key retry delays for failed reconciliations: the delay starts at a
//! configured minimum, doubles on every consecutive failure, and is capped at
//! a configured maximum. A success resets the sequence.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use trust_controller::runtime::backoff::ExponentialBackoff;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! ```

use std::time::Duration;

/// Floor for both bounds; a zero delay would never grow
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Starting value (for reset)
    start: Duration,
    /// Value returned by the next call
    current: Duration,
    /// Cap
    max: Duration,
    /// Consecutive failures since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(start: Duration, max: Duration) -> Self {
        let (start, max) = (start.max(MIN_DELAY), max.max(MIN_DELAY));
        Self {
            start,
            current: start.min(max),
            max,
            attempts: 0,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        result
    }

    /// Number of failures recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff to its starting value
    pub fn reset(&mut self) {
        self.current = self.start.min(self.max);
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_doubles_until_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let got: Vec<u128> = (0..6).map(|_| backoff.next_backoff().as_millis()).collect();
        assert_eq!(got, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_start_above_max_is_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(3));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(3));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(3));
    }

    #[test]
    fn test_no_overflow() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::MAX);
        for _ in 0..200 {
            backoff.next_backoff();
        }
        assert_eq!(backoff.next_backoff(), Duration::MAX);
    }

    #[test]
    fn test_zero_bounds_still_grow() {
        let mut backoff = ExponentialBackoff::new(Duration::ZERO, Duration::from_millis(8));
        let got: Vec<u128> = (0..5).map(|_| backoff.next_backoff().as_millis()).collect();
        assert_eq!(got, vec![1, 2, 4, 8, 8]);

        let mut backoff = ExponentialBackoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.next_backoff(), MIN_DELAY);
    }
}
