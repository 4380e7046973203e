//! Exponential backoff for flapping interfaces and transient I/O retries.

use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff state machine.
///
/// Each reported error doubles the current interval, clamped to
/// `[init, max]`. When the previous error lies further in the past than the
/// maximum interval, the next error starts over at `init`. Success clears
/// the deadline without forgetting the error history.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    init: Duration,
    max: Duration,
    current: Duration,
    deadline: Option<Instant>,
    last_error_at: Option<Instant>,
}

impl ExponentialBackoff {
    /// Creates a backoff clamped to `[init, max]`.
    pub fn new(init: Duration, max: Duration) -> Self {
        Self {
            init,
            max,
            current: Duration::ZERO,
            deadline: None,
            last_error_at: None,
        }
    }

    /// Records an error at `now` and arms the deadline.
    pub fn report_error(&mut self, now: Instant) {
        let stable_long = self
            .last_error_at
            .map_or(true, |t| now.saturating_duration_since(t) >= self.max);
        self.current = if self.current.is_zero() || stable_long {
            self.init
        } else {
            std::cmp::min(self.current * 2, self.max)
        };
        self.last_error_at = Some(now);
        self.deadline = Some(now + self.current);
    }

    /// Records a success; the deadline is cleared immediately.
    pub fn report_success(&mut self) {
        self.deadline = None;
    }

    /// Returns true when no deadline is pending at `now`.
    pub fn can_try_now(&self, now: Instant) -> bool {
        self.time_remaining(now).is_zero()
    }

    /// Remaining time until the deadline, zero when none is pending.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// The current interval (zero before the first error).
    pub fn current_interval(&self) -> Duration {
        self.current
    }

    /// The pending deadline, if armed and still in the future.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        self.deadline.filter(|d| *d > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INIT: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(800);

    #[test]
    fn test_first_error_uses_init() {
        let mut backoff = ExponentialBackoff::new(INIT, MAX);
        let now = Instant::now();
        assert!(backoff.can_try_now(now));

        backoff.report_error(now);
        assert_eq!(backoff.current_interval(), INIT);
        assert!(!backoff.can_try_now(now));
        assert!(backoff.can_try_now(now + INIT));
    }

    #[test]
    fn test_intervals_double_and_clamp() {
        let mut backoff = ExponentialBackoff::new(INIT, MAX);
        let mut now = Instant::now();
        let mut previous = Duration::ZERO;

        for _ in 0..6 {
            backoff.report_error(now);
            let current = backoff.current_interval();
            assert!(current >= previous, "intervals must be non-decreasing");
            assert!(current <= MAX);
            previous = current;
            now += Duration::from_millis(10);
        }
        assert_eq!(backoff.current_interval(), MAX);
    }

    #[test]
    fn test_reset_after_stable_period() {
        let mut backoff = ExponentialBackoff::new(INIT, MAX);
        let now = Instant::now();
        backoff.report_error(now);
        backoff.report_error(now + Duration::from_millis(10));
        assert_eq!(backoff.current_interval(), INIT * 2);

        // next error after a stable period >= max starts over at init
        backoff.report_error(now + Duration::from_millis(10) + MAX);
        assert_eq!(backoff.current_interval(), INIT);
    }

    #[test]
    fn test_success_clears_deadline() {
        let mut backoff = ExponentialBackoff::new(INIT, MAX);
        let now = Instant::now();
        backoff.report_error(now);
        assert!(!backoff.can_try_now(now));

        backoff.report_success();
        assert!(backoff.can_try_now(now));
        assert_eq!(backoff.deadline(now), None);
    }

    #[test]
    fn test_time_remaining() {
        let mut backoff = ExponentialBackoff::new(INIT, MAX);
        let now = Instant::now();
        backoff.report_error(now);
        assert_eq!(backoff.time_remaining(now), INIT);
        assert_eq!(
            backoff.time_remaining(now + Duration::from_millis(40)),
            Duration::from_millis(60)
        );
        assert_eq!(backoff.time_remaining(now + INIT), Duration::ZERO);
    }
}
