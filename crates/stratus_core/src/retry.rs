use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;

/// Exponential backoff for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// No waiting between attempts. For tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, max_attempts)
    }
}

pub enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, `classify` aborts, or the attempt budget is spent.
/// The last error is returned as-is; callers decide how to present exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut, L, C>(
    policy: RetryPolicy,
    mut operation: F,
    mut on_retry: L,
    mut classify: C,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    L: FnMut(usize, Duration, &E),
    C: FnMut(&E) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify(&err) {
                RetryDisposition::Abort => return Err(err),
                RetryDisposition::Retry => {
                    if attempt >= policy.max_attempts {
                        return Err(err);
                    }

                    on_retry(attempt, backoff, &err);
                    pause(backoff).await;
                    backoff = next_backoff(backoff, policy.max_delay);
                }
            },
        }
    }
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        yield_now().await;
    } else {
        sleep(delay).await;
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}
