//! Per-client token bucket rate limiting.
//!
//! There is no rate-limiting crate in the dependency stack this proxy draws
//! from, so the limiter is hand-rolled: one bucket per client id, refilled
//! lazily on each check rather than by a background tick.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain_types::{ClientId, RateLimitPerSecond};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket per publishing client, shared read-write across workers.
pub struct RateLimiter {
    rate: RateLimitPerSecond,
    burst: f64,
    buckets: DashMap<ClientId, Bucket>,
}

impl RateLimiter {
    /// Builds a limiter allowing `rate` messages per second per client, with
    /// a burst capacity equal to one second's worth of tokens.
    #[must_use]
    pub fn new(rate: RateLimitPerSecond) -> Self {
        Self {
            rate,
            burst: f64::from(rate.as_u32()),
            buckets: DashMap::new(),
        }
    }

    /// Attempts to consume one token for `client_id`, returning `true` if
    /// the message is allowed and `false` if the client should be rate
    /// limited.
    pub fn try_acquire(&self, client_id: &ClientId) -> bool {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(client_id.clone())
            .or_insert_with(|| Bucket {
                tokens: self.burst,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill);
        refill(&mut bucket, elapsed, f64::from(self.rate.as_u32()), self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets untouched for longer than `idle_for`, bounding memory
    /// use for clients that have disconnected.
    pub fn evict_idle(&self, idle_for: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < idle_for);
    }
}

fn refill(bucket: &mut Bucket, elapsed: Duration, rate_per_sec: f64, burst: f64) {
    let replenished = elapsed.as_secs_f64() * rate_per_sec;
    bucket.tokens = (bucket.tokens + replenished).min(burst);
}
