//! Exponential backoff with full jitter for broker reconnects.

use std::time::{Duration, Instant};

use rand::Rng;

/// Base delay before the first retry.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Delay ceiling regardless of attempt count.
pub const MAX_DELAY: Duration = Duration::from_secs(60);
/// Time spent `Connected` before the attempt counter resets to zero.
pub const STABLE_RESET_AFTER: Duration = Duration::from_secs(60);

/// Tracks reconnect attempts and produces full-jitter delays.
///
/// Full jitter: `delay = random(0, min(cap, base * 2^attempt))`. The attempt
/// counter resets once a connection has stayed `Connected` for
/// [`STABLE_RESET_AFTER`].
pub struct ReconnectBackoff {
    attempt: u32,
    connected_since: Option<Instant>,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectBackoff {
    /// Builds a fresh backoff tracker at attempt zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempt: 0,
            connected_since: None,
        }
    }

    /// Records that the connection just entered `Connected`.
    pub fn note_connected(&mut self) {
        self.connected_since = Some(Instant::now());
    }

    /// Records a transport failure, advancing the attempt counter unless the
    /// prior `Connected` period was stable enough to reset it first.
    pub fn note_failure(&mut self) {
        if let Some(since) = self.connected_since.take() {
            if since.elapsed() >= STABLE_RESET_AFTER {
                self.attempt = 0;
            }
        }
        self.attempt = self.attempt.saturating_add(1);
    }

    /// The next delay to wait before retrying, with full jitter applied.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    fn next_delay_with(&self, rng: &mut impl Rng) -> Duration {
        let exp = self.attempt.min(6);
        let unjittered = BASE_DELAY
            .checked_mul(1u32 << exp)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY);
        if unjittered.is_zero() {
            return Duration::ZERO;
        }
        let millis = unjittered.as_millis().max(1) as u64;
        Duration::from_millis(rng.gen_range(0..=millis))
    }

    /// The current attempt count, for diagnostics.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
