//! Fixed-window request counter

use std::time::Duration;
use tokio::time::Instant;

/// Admitted requests for one user since `window_start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCounter {
    pub count: u32,
    pub window_start: Instant,
}

impl RateCounter {
    /// Counter for a user's first admitted request
    pub fn new(now: Instant) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Whether a full window has elapsed since `window_start`
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    /// Count one request against the window, returning whether it is admitted
    ///
    /// An expired window resets to `{1, now}` and admits, so a burst at the
    /// end of one window can be followed by a full burst at the start of the
    /// next.
    pub fn try_admit(&mut self, now: Instant, limit: u32, window: Duration) -> bool {
        if self.is_expired(now, window) {
            *self = Self::new(now);
            return true;
        }
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_counter_admits_up_to_limit() {
        let now = Instant::now();
        let mut counter = RateCounter::new(now);
        for _ in 1..3 {
            assert!(counter.try_admit(now, 3, WINDOW));
        }
        assert_eq!(counter.count, 3);
        assert!(!counter.try_admit(now, 3, WINDOW));
        assert_eq!(counter.count, 3);
    }

    #[test]
    fn test_counter_resets_at_window_boundary() {
        let start = Instant::now();
        let mut counter = RateCounter::new(start);
        assert!(!counter.try_admit(start, 1, WINDOW));

        let later = start + WINDOW;
        assert!(counter.is_expired(later, WINDOW));
        assert!(counter.try_admit(later, 1, WINDOW));
        assert_eq!(counter.count, 1);
        assert_eq!(counter.window_start, later);
    }

    #[test]
    fn test_counter_not_expired_inside_window() {
        let start = Instant::now();
        let counter = RateCounter::new(start);
        assert!(!counter.is_expired(start + Duration::from_secs(59), WINDOW));
    }
}
