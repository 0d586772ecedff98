use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// HTTP status the advertising API uses to signal rate limiting.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Waits between remote calls.
///
/// Production code sleeps on the tokio timer; tests substitute a recorder so
/// pacing and backoff can be asserted without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Exponential backoff applied to rate-limited responses.
///
/// # Configuration
///
/// - **Retries**: 3 by default (2 for per-account metric fetches).
/// - **Delay**: `2^(attempt+1) * base_delay`, i.e. 10s, 20s, 40s with the 5s base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Same delay curve with a different retry budget.
    pub const fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: self.base_delay,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Anything carrying an HTTP status code.
pub trait HttpStatus {
    fn status_code(&self) -> u16;
}

impl HttpStatus for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

/// Runs `op`, retrying while it answers 429.
///
/// Transport errors propagate immediately. When the retry budget is spent the
/// last response is returned as-is, so callers must still check its status.
pub async fn with_backoff<F, Fut, R, E>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut op: F,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: HttpStatus,
{
    let mut attempt = 0;
    loop {
        let response = op().await?;
        if response.status_code() != TOO_MANY_REQUESTS || attempt >= policy.max_retries {
            return Ok(response);
        }

        let wait = policy.delay_for(attempt);
        tracing::warn!(
            "Rate limited, waiting {}s before retry {}/{}",
            wait.as_secs(),
            attempt + 1,
            policy.max_retries
        );
        sleeper.sleep(wait).await;
        attempt += 1;
    }
}
