// =============================================================================
// Rate Limiter — dual sliding windows gating every outbound call
// =============================================================================
//
// The venue enforces both a per-second and a per-minute request budget. A
// caller acquires a permit before sending; the permit is granted only when
// BOTH windows admit it, otherwise the caller sleeps until the oldest
// timestamp in the blocking window expires.
//
// Waits are tracked: persistent blocking is a signal the circuit breaker
// consumes via `breach_count()`.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default per-second request budget.
const PER_SECOND_LIMIT: usize = 10;
/// Default per-minute request budget.
const PER_MINUTE_LIMIT: usize = 300;

struct Window {
    span: Duration,
    limit: usize,
    stamps: VecDeque<Instant>,
}

impl Window {
    fn new(span: Duration, limit: usize) -> Self {
        Self {
            span,
            limit,
            stamps: VecDeque::with_capacity(limit),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.stamps.front() {
            if now.duration_since(front) >= self.span {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until this window admits another request, `Duration::ZERO` if it
    /// already does.
    fn wait_needed(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.stamps.len() < self.limit {
            return Duration::ZERO;
        }
        // Oldest stamp leaves the window first.
        let oldest = *self.stamps.front().expect("window is full");
        self.span.saturating_sub(now.duration_since(oldest))
    }
}

/// Serialisable view of the limiter for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_per_second: usize,
    pub used_per_minute: usize,
    pub breaches: u64,
}

/// Dual sliding-window limiter shared by every REST call.
pub struct RateLimiter {
    windows: Mutex<(Window, Window)>,
    /// Number of acquisitions that had to wait.
    breaches: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(PER_SECOND_LIMIT, PER_MINUTE_LIMIT)
    }

    pub fn with_limits(per_second: usize, per_minute: usize) -> Self {
        Self {
            windows: Mutex::new((
                Window::new(Duration::from_secs(1), per_second),
                Window::new(Duration::from_secs(60), per_minute),
            )),
            breaches: AtomicU64::new(0),
        }
    }

    /// Block until both windows admit one request, then record it.
    pub async fn acquire(&self) {
        let mut waited = false;
        loop {
            let wait = {
                let now = Instant::now();
                let mut guard = self.windows.lock();
                let (ref mut second, ref mut minute) = *guard;
                let wait = second.wait_needed(now).max(minute.wait_needed(now));
                if wait.is_zero() {
                    second.stamps.push_back(now);
                    minute.stamps.push_back(now);
                    break;
                }
                wait
            };

            if !waited {
                waited = true;
                self.breaches.fetch_add(1, Ordering::Relaxed);
                warn!(wait_ms = wait.as_millis() as u64, "rate limiter blocking caller");
            } else {
                debug!(wait_ms = wait.as_millis() as u64, "rate limiter still blocked");
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Cumulative count of acquisitions that had to wait. Persistent growth
    /// feeds the circuit breaker's failure accounting.
    pub fn breach_count(&self) -> u64 {
        self.breaches.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let now = Instant::now();
        let mut guard = self.windows.lock();
        let (ref mut second, ref mut minute) = *guard;
        second.prune(now);
        minute.prune(now);
        RateLimitSnapshot {
            used_per_second: second.stamps.len(),
            used_per_minute: minute.stamps.len(),
            breaches: self.breaches.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimiter")
            .field("used_per_second", &snap.used_per_second)
            .field("used_per_minute", &snap.used_per_minute)
            .field("breaches", &snap.breaches)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_without_waiting() {
        let limiter = RateLimiter::with_limits(5, 100);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.breach_count(), 0);
        assert_eq!(limiter.snapshot().used_per_second, 5);
    }

    #[tokio::test]
    async fn sixth_call_in_one_second_waits() {
        tokio::time::pause();
        let limiter = RateLimiter::with_limits(5, 100);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // The sixth acquisition must block until the window rolls.
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
        assert_eq!(limiter.breach_count(), 1);
    }

    #[tokio::test]
    async fn minute_window_also_gates() {
        tokio::time::pause();
        let limiter = RateLimiter::with_limits(100, 3);
        for _ in 0..3 {
            limiter.acquire().await;
        }
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        // Blocked by the minute window, not the second window.
        assert!(start.elapsed() >= Duration::from_secs(59));
    }
}
