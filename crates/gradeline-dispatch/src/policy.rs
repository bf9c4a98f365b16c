use std::time::Duration;

use rand::Rng;

/// How many times a delivery is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the 2nd, 3rd, ... attempt. The last entry repeats.
    pub backoff: Vec<Duration>,
    /// Fraction of a delay that may be added at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(3, &[60, 180, 600], 0.0)
    }
}

impl RetryPolicy {
    pub fn from_secs(max_attempts: u32, backoff_secs: &[u64], jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: backoff_secs.iter().copied().map(Duration::from_secs).collect(),
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    /// `true` once `attempts_made` attempts leave no budget for another.
    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }

    /// Lower bound on the wait before `next_attempt` (2 for the first retry).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let idx = next_attempt.saturating_sub(2) as usize;
        self.backoff
            .get(idx)
            .or(self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Extends `delay` by up to `jitter * delay`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(factor)
    }
}
