//! Exponential reconnect backoff with jitter

use std::time::Duration;

use rand::Rng;

/// Reconnect delay policy for the event bus bridge
///
/// Delay for attempt `n` is `min(max, base * 2^n)` scaled by a random factor
/// in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let random: f64 = rand::thread_rng().gen();
        self.delay_with_random(attempt, random)
    }

    /// Same as [`Backoff::delay`] with the random draw supplied by the caller
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;

        let exponential = base_ms.saturating_mul(1u64 << attempt.min(31));
        let capped = exponential.min(max_ms);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let scale = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;

        Duration::from_millis((capped as f64 * scale).round().max(0.0) as u64)
    }
}
