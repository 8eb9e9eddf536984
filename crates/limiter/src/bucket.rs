use std::time::Duration;
use tokio::time::Instant;

/// A vendor-published request budget: `requests` per `window`, with up to
/// `burst` immediately available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub requests: u32,
    pub window: Duration,
    pub burst: u32,
}

impl RateLimit {
    pub const fn per_second(requests: u32) -> Self {
        Self {
            requests,
            window: Duration::from_secs(1),
            burst: requests,
        }
    }

    pub const fn per_minute(requests: u32) -> Self {
        Self {
            requests,
            window: Duration::from_secs(60),
            burst: requests,
        }
    }

    pub const fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    fn refill_per_second(&self) -> f64 {
        self.requests as f64 / self.window.as_secs_f64()
    }
}

/// Leaky-bucket gate entered before every outbound request.
///
/// Shared across all concurrent jobs of one tenant via [`crate::Registry`];
/// the internal mutex serializes token accounting while waits happen outside
/// of it.
pub struct TokenBucket {
    limit: RateLimit,
    state: tokio::sync::Mutex<State>,
}

struct State {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: tokio::sync::Mutex::new(State {
                tokens: limit.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Suspend until a request token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.limit.refill_per_second())
                    .min(self.limit.burst as f64);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.limit.refill_per_second())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_immediate_then_paced() {
        let bucket = TokenBucket::new(RateLimit::per_second(2).with_burst(2));
        let start = Instant::now();

        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The third acquire must wait for one refill interval (0.5s).
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn per_minute_pacing() {
        let bucket = TokenBucket::new(RateLimit::per_minute(60).with_burst(1));
        let start = Instant::now();

        bucket.acquire().await;
        bucket.acquire().await;

        // 60/min refills one token per second.
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_do_not_exceed_burst() {
        let bucket = TokenBucket::new(RateLimit::per_second(100).with_burst(3));

        // A long idle period must not bank more than `burst` tokens.
        tokio::time::sleep(Duration::from_secs(60)).await;

        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        bucket.acquire().await;
        assert!(start.elapsed() > Duration::ZERO);
    }
}
