//! Per-port circuit breaker.
//!
//! Five consecutive failures within ten seconds open the breaker; after
//! thirty seconds it lets one probe through, and a single success closes it
//! again. Stages consult the breaker before calling their port and run in a
//! degraded mode while it is open: energy-only VAD, suppressed ASR drafts,
//! pass-through translation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::ports::Clock;

const FAILURE_THRESHOLD: u32 = 5;
const FAILURE_WINDOW_MS: u64 = 10_000;
const COOL_DOWN_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    /// Time of the first failure in the current consecutive run.
    first_failure_ms: u64,
    opened_at_ms: u64,
}

pub struct CircuitBreaker {
    name: &'static str,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                first_failure_ms: 0,
                opened_at_ms: 0,
            }),
        }
    }

    /// Current state, promoting `Open` to `HalfOpen` once the cool-down has
    /// elapsed.
    pub fn state(&self) -> BreakerState {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open && now.saturating_sub(inner.opened_at_ms) >= COOL_DOWN_MS
        {
            inner.state = BreakerState::HalfOpen;
            info!(port = self.name, "circuit breaker half-open, probing");
        }
        inner.state
    }

    /// Whether the stage should attempt a port call right now. In `HalfOpen`
    /// exactly the next caller becomes the probe.
    pub fn allows_call(&self) -> bool {
        self.state() != BreakerState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(port = self.name, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    /// Record a failure; `fatal` failures open the breaker immediately.
    pub fn record_failure(&self, fatal: bool) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                // The probe failed; back to a full cool-down.
                inner.state = BreakerState::Open;
                inner.opened_at_ms = now;
                warn!(port = self.name, "circuit breaker re-opened after failed probe");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                if fatal {
                    inner.state = BreakerState::Open;
                    inner.opened_at_ms = now;
                    inner.consecutive_failures = 0;
                    warn!(port = self.name, "circuit breaker opened on fatal failure");
                    return;
                }
                if inner.consecutive_failures == 0
                    || now.saturating_sub(inner.first_failure_ms) > FAILURE_WINDOW_MS
                {
                    inner.consecutive_failures = 0;
                    inner.first_failure_ms = now;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= FAILURE_THRESHOLD {
                    inner.state = BreakerState::Open;
                    inner.opened_at_ms = now;
                    inner.consecutive_failures = 0;
                    warn!(
                        port = self.name,
                        "circuit breaker opened after {FAILURE_THRESHOLD} consecutive failures"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestClock(AtomicU64);

    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn breaker() -> (Arc<TestClock>, CircuitBreaker) {
        let clock = Arc::new(TestClock(AtomicU64::new(0)));
        let breaker = CircuitBreaker::new("test", clock.clone());
        (clock, breaker)
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let (_, b) = breaker();
        for _ in 0..4 {
            b.record_failure(false);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure(false);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allows_call());
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let (clock, b) = breaker();
        for _ in 0..4 {
            b.record_failure(false);
        }
        // The window expires; the run restarts from one.
        clock.0.store(11_000, Ordering::Relaxed);
        b.record_failure(false);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn success_resets_the_run() {
        let (_, b) = breaker();
        for _ in 0..4 {
            b.record_failure(false);
        }
        b.record_success();
        b.record_failure(false);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let (clock, b) = breaker();
        b.record_failure(true);
        assert_eq!(b.state(), BreakerState::Open);

        clock.0.store(30_000, Ordering::Relaxed);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.allows_call());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let (clock, b) = breaker();
        b.record_failure(true);
        clock.0.store(30_000, Ordering::Relaxed);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure(false);
        assert_eq!(b.state(), BreakerState::Open);
        // A fresh cool-down is required.
        clock.0.store(45_000, Ordering::Relaxed);
        assert_eq!(b.state(), BreakerState::Open);
        clock.0.store(60_000, Ordering::Relaxed);
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }
}
