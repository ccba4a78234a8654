use crate::error::{ErrorClass, ProviderError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Classify-and-backoff wrapper for provider calls.
///
/// Retryable failures are re-attempted up to `max_retries` times with
/// exponential backoff; terminal failures surface immediately. There is no
/// shared state: every identity carries its own policy value.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (0-indexed).
    ///
    /// `min(base * 2^attempt, max)`; a 429 doubles the result since the
    /// provider told us explicitly to slow down. Jitter draws uniformly in
    /// `[0, delay]` to spread identities that fail in lockstep. Also used
    /// by the IAM OCC loop, whose conflict re-reads back off the same way.
    pub(crate) fn delay_for(&self, attempt: u32, status: Option<u16>) -> Duration {
        let exp = attempt.min(32);
        let mut delay = self
            .base_delay
            .saturating_mul(1u32 << exp.min(31))
            .min(self.max_delay);
        if status == Some(429) {
            delay = delay.saturating_mul(2).min(self.max_delay);
        }
        if self.jitter {
            let millis = delay.as_millis() as u64;
            if millis > 0 {
                delay = Duration::from_millis(rand::thread_rng().gen_range(0..=millis));
            }
        }
        delay
    }

    /// Run `op`, retrying retryable failures until `max_retries` is hit.
    pub async fn run<T, Fut, Op>(&self, mut op: Op) -> Result<T, ProviderError>
    where
        Fut: Future<Output = Result<T, ProviderError>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.classify() == ErrorClass::Terminal || attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt, err.status());
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable provider failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_429s() {
        let calls = AtomicU32::new(0);
        let result = quick()
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Http {
                            status: 429,
                            message: "quota".into(),
                        })
                    } else {
                        Ok("listed")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "listed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::Http {
                        status: 404,
                        message: "no such project".into(),
                    })
                }
            })
            .await;
        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_exhaust_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Transport("reset".into())) }
            })
            .await;
        assert!(result.unwrap_err().is_retryable());
        // Initial attempt plus max_retries retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(policy.delay_for(0, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5, None), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6, None), Duration::from_secs(60));
        assert_eq!(policy.delay_for(20, None), Duration::from_secs(60));
    }

    #[test]
    fn rate_limited_responses_double_the_delay() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(policy.delay_for(0, Some(429)), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1, Some(429)), Duration::from_secs(4));
        // The cap still holds.
        assert_eq!(policy.delay_for(6, Some(429)), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_the_computed_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        };
        for _ in 0..50 {
            assert!(policy.delay_for(2, None) <= Duration::from_secs(4));
        }
    }
}
