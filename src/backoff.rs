use std::time::Duration;

/// Exponential-with-full-jitter backoff, shared by every sink's retry path.
///
/// `delay(attempt)` returns `base * 2^attempt` capped at `max`, scaled by a
/// uniform random factor in `[0, 1)` ("full jitter" — the schedule most of
/// the corpus's retrying batch writers converge on independently).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        // Cap the exponent well below where `2^attempt` would overflow `u32`
        // (`Duration::saturating_mul` takes a `u32` multiplier); any value
        // this large already saturates past `self.max` for realistic bases.
        let exp = 2u64.saturating_pow(attempt.min(20)).min(u32::MAX as u64) as u32;
        let uncapped = self.base.saturating_mul(exp);
        let capped = uncapped.min(self.max);
        let jitter = rand::random::<f64>();
        Duration::from_secs_f64(capped.as_secs_f64() * jitter)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
