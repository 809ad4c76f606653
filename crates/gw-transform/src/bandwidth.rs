//! Token-bucket bandwidth limiter, one per tunnel direction.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Limits throughput to `rate_bytes_per_sec`, bursting up to `capacity`
/// bytes. `wait_n` derives its sleep from the bucket's own clock so it can
/// be raced against a cancellation future by the caller.
pub struct TokenBucket {
    rate_bytes_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = (rate_bytes_per_sec as f64).max(1.0);
        Self {
            rate_bytes_per_sec: rate_bytes_per_sec as f64,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_bytes_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Block until `n` bytes' worth of tokens are available, then consume
    /// them. Cancellation-safe: callers race this against their own
    /// shutdown signal with `tokio::select!`.
    pub async fn wait_n(&self, n: u64) {
        let n = n as f64;
        loop {
            let deficit = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= n {
                    bucket.tokens -= n;
                    return;
                }
                n - bucket.tokens
            };
            let wait = Duration::from_secs_f64((deficit / self.rate_bytes_per_sec).max(0.001));
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_immediate() {
        let bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();
        bucket.wait_n(500_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exceeding_capacity_waits_proportionally() {
        let bucket = TokenBucket::new(100_000);
        // Drain the initial burst first.
        bucket.wait_n(100_000).await;
        let start = Instant::now();
        bucket.wait_n(50_000).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
