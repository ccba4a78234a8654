use crate::error::ProviderError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Per-identity token buckets admitting at most `qps` provider calls per
/// second each.
///
/// Buckets are created lazily on first acquire and live for the process
/// lifetime. The map lock is only held to refill and take a token, never
/// across a sleep.
#[derive(Debug)]
pub struct RateGate {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate: f64,
    capacity: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateGate {
    pub fn new(qps: u32) -> Self {
        let qps = qps.max(1) as f64;
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate: qps,
            capacity: qps,
        }
    }

    /// Take one token for `identity`, waiting up to `timeout` for one to
    /// become available.
    pub async fn acquire(&self, identity: &str, timeout: Duration) -> Result<(), ProviderError> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().expect("rate gate lock poisoned");
                let bucket = buckets.entry(identity.to_string()).or_insert_with(|| {
                    // A fresh bucket starts full; nothing is pre-consumed.
                    Bucket {
                        tokens: self.capacity,
                        last_refill: Instant::now(),
                    }
                });

                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }

                // Seconds until one whole token exists again.
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(ProviderError::RateGate {
                    identity: identity.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(wait.min(remaining)).await;
        }
    }
}
