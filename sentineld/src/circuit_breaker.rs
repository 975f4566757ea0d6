//! Per-position circuit breaker.
//!
//! After `failure_threshold` consecutive failed ticks the breaker opens and
//! the watcher skips non-essential work until the cooldown expires. The next
//! tick is a trial (half-open): success closes the breaker, failure reopens
//! it with the timer reset.
//!
//! Owned by a single watcher, so no interior locking.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BreakerConfig;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, counting consecutive failures
    Closed { failures: u32 },
    /// Tripped; non-essential work is refused until the cooldown expires
    Open { since: Instant },
    /// Cooldown expired; the next tick decides
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown,
        }
    }

    /// Current state
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether non-essential work may run this tick.
    ///
    /// An open breaker whose cooldown has expired moves to half-open.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// A tick completed without error.
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed { failures: 0 };
    }

    /// A tick failed. Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    self.state = BreakerState::Open { since: Instant::now() };
                    true
                } else {
                    self.state = BreakerState::Closed { failures };
                    false
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open { since: Instant::now() };
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    /// Remaining cooldown time (zero unless open).
    pub fn remaining_cooldown(&self) -> Duration {
        match self.state {
            BreakerState::Open { since } => self.cooldown.saturating_sub(since.elapsed()),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_starts_closed() {
        let mut cb = breaker();
        assert!(cb.allow());
        assert_eq!(cb.state(), BreakerState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_failures() {
        let mut cb = breaker();
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert!(cb.allow()); // 2 < 3
        assert!(cb.record_failure());
        assert!(!cb.allow()); // 3 >= 3 → open
    }

    #[test]
    fn test_success_resets_counter() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure(); // 1 failure after reset
        assert!(cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cb.allow());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed { failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timer() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cb.allow());

        assert!(cb.record_failure());
        assert!(!cb.allow());
        assert_eq!(cb.remaining_cooldown(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cb.allow());
    }
}
