//! Advertisement throttling.
//!
//! A throttle coalesces repeated triggers inside a small window into one
//! deferred fire. Once armed it fires exactly once, with whatever state
//! exists at fire time; re-arming while armed does not extend the deadline,
//! so a burst of triggers cannot starve the fire.

use std::time::Duration;
use tokio::time::Instant;

/// Deadline-based coalescing throttle, driven by the owning event loop.
#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    deadline: Option<Instant>,
}

impl Throttle {
    /// Creates a throttle with the given coalescing window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Arms the throttle; a no-op while already armed.
    pub fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// Arms (or re-arms) the throttle at an explicit delay, overriding any
    /// pending deadline. Used for error-backoff re-arming.
    pub fn arm_after(&mut self, now: Instant, delay: Duration) {
        self.deadline = Some(now + delay);
    }

    /// Returns true while a fire is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The pending deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consumes a due deadline. Returns true exactly once per arming, when
    /// the deadline has been reached.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Drops a pending fire without running it.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(20);

    #[test]
    fn test_arm_and_fire_once() {
        let mut throttle = Throttle::new(WINDOW);
        let now = Instant::now();
        assert!(!throttle.is_armed());

        throttle.arm(now);
        assert!(throttle.is_armed());
        assert!(!throttle.take_due(now));
        assert!(throttle.take_due(now + WINDOW));
        // consumed: no second fire
        assert!(!throttle.take_due(now + WINDOW * 2));
    }

    #[test]
    fn test_rearm_does_not_extend_deadline() {
        let mut throttle = Throttle::new(WINDOW);
        let now = Instant::now();
        throttle.arm(now);
        throttle.arm(now + Duration::from_millis(15));
        // still fires at the original deadline
        assert!(throttle.take_due(now + WINDOW));
    }

    #[test]
    fn test_burst_coalesces_to_one_fire() {
        let mut throttle = Throttle::new(WINDOW);
        let now = Instant::now();
        for i in 0..10 {
            throttle.arm(now + Duration::from_millis(i));
        }
        let mut fires = 0;
        for i in 0..100 {
            if throttle.take_due(now + Duration::from_millis(i)) {
                fires += 1;
            }
        }
        assert_eq!(fires, 1);
    }

    #[test]
    fn test_arm_after_overrides() {
        let mut throttle = Throttle::new(WINDOW);
        let now = Instant::now();
        throttle.arm(now);
        throttle.arm_after(now, Duration::from_millis(100));
        assert!(!throttle.take_due(now + WINDOW));
        assert!(throttle.take_due(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_cancel() {
        let mut throttle = Throttle::new(WINDOW);
        let now = Instant::now();
        throttle.arm(now);
        throttle.cancel();
        assert!(!throttle.is_armed());
        assert!(!throttle.take_due(now + WINDOW));
    }
}
