// =============================================================================
// Rate limiter — fixed-window token acquisition for REST clients
// =============================================================================
//
// Each exchange API instance holds one limiter per market type, except Bybit
// where a single limiter is shared across spot/linear/inverse because the
// kline endpoint (and therefore the quota) is shared.
// =============================================================================

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Window {
    started: Instant,
    used: u32,
}

/// Allows at most `max_requests` acquisitions per `period`. Callers that
/// exceed the budget sleep until the window rolls over.
pub struct RateLimiter {
    max_requests: u32,
    period: Duration,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, period: Duration) -> Self {
        assert!(max_requests > 0, "limiter needs a positive budget");
        Self {
            max_requests,
            period,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Acquire one request token, sleeping while the current window is
    /// exhausted.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut w = self.window.lock().await;
                let elapsed = w.started.elapsed();
                if elapsed >= self.period {
                    w.started = Instant::now();
                    w.used = 0;
                }
                if w.used < self.max_requests {
                    w.used += 1;
                    return;
                }
                self.period - w.started.elapsed().min(self.period)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter saturated");
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("period", &self.period)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn within_budget_never_sleeps() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        let t0 = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_waits_for_next_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let t0 = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        // Third acquisition has to wait out the remainder of the window.
        limiter.acquire().await;
        assert!(t0.elapsed() >= Duration::from_secs(1));
        // The fresh window has a token left over for the fourth.
        let t1 = Instant::now();
        limiter.acquire().await;
        assert_eq!(t1.elapsed(), Duration::ZERO);
    }
}
