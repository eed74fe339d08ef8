//! Exponential reconnect backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Doubling delay capped at a ceiling, jittered into `[d/2, d]`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Backoff starting at `base`, never above `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Attempts since the last reset
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt
    #[must_use]
    pub fn ceiling_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt; advances the attempt count
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Same as `next_delay` with a caller-provided RNG
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let ceiling = self.ceiling_delay();
        self.attempt = self.attempt.saturating_add(1);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms < 2 {
            return ceiling;
        }
        Duration::from_millis(rng.gen_range(ceiling_ms / 2..=ceiling_ms))
    }

    /// Back to the base delay after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
