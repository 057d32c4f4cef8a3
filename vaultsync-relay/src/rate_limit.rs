//! Token bucket rate limiter per device.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<Uuid, TokenBucket>>>,
    max_tokens: u32,
    refill_rate: f64, // tokens per second
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_tokens: requests_per_minute,
            refill_rate: requests_per_minute as f64 / 60.0,
        }
    }

    /// Take one token for `device_id`. `false` when the bucket is empty.
    pub fn check(&self, device_id: Uuid) -> bool {
        self.check_at(device_id, Instant::now())
    }

    fn check_at(&self, device_id: Uuid, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(device_id).or_insert(TokenBucket {
            tokens: self.max_tokens as f64,
            last_refill: now,
        });

        // Refill tokens
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Forget buckets that have been full for a while.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let refilled = bucket.tokens
                + now.saturating_duration_since(bucket.last_refill).as_secs_f64() * self.refill_rate;
            refilled < self.max_tokens as f64
        });
        before - buckets.len()
    }
}
