//! Retry scheduling for transient failures (Coordinator Client calls and
//! Worker Pool part uploads both use this).
//!
//! `delay(n) = min(base * 2^n, max)`, with optional full jitter applied on
//! top so a burst of workers retrying at once doesn't all land on the same
//! tick.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `n` (0-based: `n == 0` is the first retry after
    /// the initial attempt). Jitter, when enabled, draws uniformly from
    /// `[0, computed_delay]` rather than adding to it, so the worst case
    /// never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << n.min(32));
        let capped = exp.min(self.max_delay.as_millis());
        let millis = capped as u64;

        if self.jitter && millis > 0 {
            let jittered = rand::thread_rng().gen_range(0..=millis);
            Duration::from_millis(jittered)
        } else {
            Duration::from_millis(millis)
        }
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
