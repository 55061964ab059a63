use crate::clock::Sleeper;
use crate::error::FetchError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Upper bound on extra attempts after a broker server error.
pub const MAX_FETCH_RETRIES: usize = 2;

/// Bounded retry schedule: one backoff entry per extra attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Single attempt, never waits.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn max_retries(&self) -> u32 {
        self.backoff.len() as u32
    }

    /// Wait before retry number `retry` (1-based), `None` once exhausted.
    pub fn backoff_for(&self, retry: u32) -> Option<Duration> {
        retry
            .checked_sub(1)
            .and_then(|i| self.backoff.get(i as usize))
            .copied()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&[60, 90])
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of backoff entries. `op` receives the 1-based attempt.
pub async fn fetch_with_retry<T, F, Fut, Z>(
    policy: &RetryPolicy,
    sleeper: &Z,
    token: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    Z: Sleeper + ?Sized,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => match policy.backoff_for(attempt) {
                Some(wait) => {
                    warn!(
                        token,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "server error, backing off before retry"
                    );
                    sleeper.sleep(wait).await;
                    attempt += 1;
                }
                None => {
                    return Err(FetchError::RetriesExhausted {
                        token: token.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
            },
            Err(err) => return Err(err),
        }
    }
}
