//! Per-session cap on how many doorbell events may trigger a ring drain in
//! one period.
//!
//! Once the allowance is used up the doorbell is left masked; the next
//! period rollover unmasks it exactly once.

use std::time::{Duration, Instant};

/// Events allowed in each period.
pub const RATE_LIMIT_ALLOWANCE: u32 = 30;
/// Length of each period.
pub const RATE_LIMIT_PERIOD: Duration = Duration::from_millis(200);
/// The readiness wait often returns a couple of ms early. Without this we
/// would do an extra spin with a sub-ms timeout every other period.
pub const RATE_LIMIT_FUZZ: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub allowance: u32,
    pub period: Duration,
    pub fuzz: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            allowance: RATE_LIMIT_ALLOWANCE,
            period: RATE_LIMIT_PERIOD,
            fuzz: RATE_LIMIT_FUZZ,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    cfg: RateLimitConfig,
    event_count: u32,
    next_period: Instant,
}

impl RateLimiter {
    #[must_use]
    pub fn new(cfg: RateLimitConfig, now: Instant) -> Self {
        Self {
            cfg,
            event_count: 0,
            next_period: now + cfg.period,
        }
    }

    #[must_use]
    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    #[must_use]
    pub fn next_period(&self) -> Instant {
        self.next_period
    }

    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.event_count >= self.cfg.allowance
    }

    /// Roll the period over if it is (nearly) due. Returns `true` when the
    /// session had been saturated, i.e. its doorbell must now be unmasked.
    pub fn refill(&mut self, now: Instant) -> bool {
        if now + self.cfg.fuzz < self.next_period {
            return false;
        }
        let was_saturated = self.is_saturated();
        self.next_period = now + self.cfg.period;
        self.event_count = 0;
        was_saturated
    }

    /// Count one delivered doorbell event. Returns `true` while the
    /// doorbell may be re-armed.
    pub fn record_event(&mut self) -> bool {
        self.event_count = self.event_count.saturating_add(1);
        !self.is_saturated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(allowance: u32) -> RateLimitConfig {
        RateLimitConfig {
            allowance,
            ..Default::default()
        }
    }

    #[test]
    fn saturates_at_allowance() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(cfg(30), now);
        for _ in 0..29 {
            assert!(rl.record_event());
        }
        assert!(!rl.is_saturated());
        assert!(!rl.record_event());
        assert!(rl.is_saturated());
        assert_eq!(rl.event_count(), 30);
    }

    #[test]
    fn refill_waits_for_period() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(cfg(2), now);
        rl.record_event();
        rl.record_event();

        assert!(!rl.refill(now + Duration::from_millis(100)));
        assert!(rl.is_saturated());

        // inside the fuzz margin counts as due
        let due = now + RATE_LIMIT_PERIOD - Duration::from_millis(3);
        assert!(rl.refill(due));
        assert_eq!(rl.event_count(), 0);
        assert_eq!(rl.next_period(), due + RATE_LIMIT_PERIOD);
    }

    #[test]
    fn refill_of_unsaturated_session_does_not_unmask() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(cfg(30), now);
        rl.record_event();
        assert!(!rl.refill(now + RATE_LIMIT_PERIOD));
        assert_eq!(rl.event_count(), 0);
    }
}
