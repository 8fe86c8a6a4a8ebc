// =============================================================================
// Circuit Breaker — fail fast after a burst of exchange failures
// =============================================================================
//
// States:
//
//   Closed    — normal operation; consecutive failures within the window are
//               counted, k of them trip the breaker.
//   Open      — every call fails immediately with CircuitOpen until the
//               cooldown elapses.
//   HalfOpen  — exactly one probe call is admitted; success closes the
//               breaker, failure re-opens it.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Consecutive failures that trip the breaker.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Window in which those failures must occur.
const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);
/// Open-state cooldown before a probe is admitted.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Serialisable view for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    failure_window: Duration,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_params(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_FAILURE_WINDOW,
            DEFAULT_COOLDOWN,
        )
    }

    pub fn with_params(failure_threshold: u32, failure_window: Duration, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_threshold,
            failure_window,
            cooldown,
        }
    }

    /// Check admission at the start of an outbound call.
    ///
    /// Returns `false` when the call must fail fast with `CircuitOpen`.
    /// In half-open state only a single probe is admitted at a time.
    pub fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    info!("circuit breaker cooldown elapsed — admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a failed call; may trip the breaker.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.state == BreakerState::HalfOpen {
            warn!("circuit breaker probe failed — re-opening");
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
            return;
        }

        // Failures outside the window restart the count.
        match inner.first_failure_at {
            Some(first) if now.duration_since(first) <= self.failure_window => {
                inner.consecutive_failures += 1;
            }
            _ => {
                inner.first_failure_at = Some(now);
                inner.consecutive_failures = 1;
            }
        }

        if inner.consecutive_failures >= self.failure_threshold {
            warn!(
                failures = inner.consecutive_failures,
                "circuit breaker tripped — failing fast"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_failures() {
        let cb = CircuitBreaker::new();
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.admit());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        tokio::time::pause();
        let cb = CircuitBreaker::with_params(2, Duration::from_secs(60), Duration::from_secs(5));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.admit());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cb.admit()); // probe
        assert!(!cb.admit()); // second caller rejected while probe in flight
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.admit());
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        tokio::time::pause();
        let cb = CircuitBreaker::with_params(1, Duration::from_secs(60), Duration::from_secs(5));
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cb.admit());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.admit());
    }
}
