//! Rate limiting and retry for connector clients.
//!
//! Clients translate transport and vendor responses into the [`Error`]
//! taxonomy; [`retry`] drives backoff over it. Waits longer than the
//! extend-visibility threshold are not slept through: they surface as
//! [`Error::ExtendVisibility`], which the worker harness translates into a
//! queue visibility change so the job is redelivered after the wait instead
//! of holding a worker slot.

use std::time::Duration;

mod bucket;
mod registry;

pub use bucket::{RateLimit, TokenBucket};
pub use registry::Registry;

/// Added to the computed delay when converting it to a visibility timeout,
/// covering redelivery latency.
const EXTEND_VISIBILITY_PAD: Duration = Duration::from_secs(5);

/// Fallback wait applied when a transport-level failure (timeout, connection
/// reset) is classified as rate-limit-like.
const TRANSPORT_RETRY_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server asked us to slow down, or the failure is transient enough
    /// to be treated that way (timeouts, 5xx, connection errors).
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// 401/403, including refresh-token exchange failures. Never retried.
    #[error("authentication failed (status {status}): {body}")]
    AuthFailed { status: u16, body: String },
    /// 404 on a specific resource. Lookup methods surface this as `None`.
    #[error("resource not found")]
    NotFound,
    /// Any other non-retryable vendor error.
    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
    /// Not an error: the computed wait exceeds the threshold, so the job
    /// must extend the message's visibility and yield.
    #[error("extend message visibility by {}s and yield", .0.as_secs())]
    ExtendVisibility(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn rate_limited(retry_after_secs: u64, message: impl Into<String>) -> Self {
        Error::RateLimited {
            retry_after: Some(Duration::from_secs(retry_after_secs)),
            message: message.into(),
        }
    }

    /// Classify an HTTP status + body. 429 callers should prefer building
    /// `RateLimited` directly so the Retry-After hint is preserved.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Error::AuthFailed { status, body },
            404 => Error::NotFound,
            500..=599 => Error::RateLimited {
                retry_after: Some(TRANSPORT_RETRY_AFTER),
                message: format!("server error {status}: {body}"),
            },
            _ => Error::Api { status, body },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::RateLimited {
                retry_after: Some(TRANSPORT_RETRY_AFTER),
                message: format!("transient transport error: {err}"),
            }
        } else {
            Error::Other(anyhow::Error::new(err).context("HTTP request failed"))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Delays above this yield to the queue instead of sleeping in-process.
    pub extend_visibility_threshold: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            extend_visibility_threshold: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

/// Run `op`, retrying on `RateLimited` per `policy`.
///
/// The delay is the server hint when present, else exponential from
/// `base_delay`. A delay above the threshold converts to `ExtendVisibility`
/// without consuming an attempt; exhausted retries re-raise the final
/// `RateLimited` as terminal. All other errors pass through untouched.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(Error::RateLimited {
                retry_after,
                message,
            }) => {
                let delay =
                    retry_after.unwrap_or_else(|| policy.base_delay * 2u32.saturating_pow(attempt));

                if delay > policy.extend_visibility_threshold {
                    tracing::info!(
                        what,
                        delay_secs = delay.as_secs(),
                        "wait exceeds in-process threshold; yielding to queue"
                    );
                    return Err(Error::ExtendVisibility(delay + EXTEND_VISIBILITY_PAD));
                }
                if attempt >= policy.max_retries {
                    return Err(Error::RateLimited {
                        retry_after: Some(delay),
                        message,
                    });
                }

                tracing::warn!(
                    what,
                    attempt,
                    delay_secs = delay.as_secs(),
                    message,
                    "rate limited; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry(RetryPolicy::default(), "test", || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(Error::rate_limited(3, "slow down")),
                n => Ok(n),
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn long_waits_become_extend_visibility() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result: Result<()> = retry(RetryPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::rate_limited(40, "long wait"))
        })
        .await;

        match result {
            Err(Error::ExtendVisibility(timeout)) => {
                assert_eq!(timeout, Duration::from_secs(45));
            }
            other => panic!("expected ExtendVisibility, got {other:?}"),
        }
        // No further attempts were made, and no time was slept.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reraises_rate_limited() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(RetryPolicy::with_max_retries(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::rate_limited(1, "persistent"))
        })
        .await;

        assert!(matches!(result, Err(Error::RateLimited { .. })));
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn server_hint_paces_the_next_attempt() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let _: Result<()> = retry(RetryPolicy::default(), "test", || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::rate_limited(7, "hinted")),
                _ => Ok(()),
            }
        })
        .await;

        // The second request departed no earlier than the hint.
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_pass_through() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(RetryPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::AuthFailed {
                status: 401,
                body: "bad token".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(Error::AuthFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            Error::from_status(401, String::new()),
            Error::AuthFailed { .. }
        ));
        assert!(Error::from_status(404, String::new()).is_not_found());
        assert!(matches!(
            Error::from_status(503, String::new()),
            Error::RateLimited { .. }
        ));
        assert!(matches!(
            Error::from_status(422, String::new()),
            Error::Api { status: 422, .. }
        ));
    }
}
