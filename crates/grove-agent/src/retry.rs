use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configures retry behaviour for agent invocations.
///
/// The delay before retry `attempt` (zero-based) is
/// `min(backoff_base_ms × 2^attempt, backoff_max_ms)` plus a uniform random
/// jitter in `0..=jitter_ms`, so a burst of failing tasks does not hammer
/// the external agent in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocation attempts per task, the first included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Upper bound of the uniform jitter added to each delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// Computes the backoff delay in milliseconds for a zero-based attempt.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.backoff_max_ms);
        if self.jitter_ms == 0 {
            return exp;
        }
        exp.saturating_add(rand::rng().random_range(0..=self.jitter_ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ms: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.delay_ms(0), 500);
        assert_eq!(policy.delay_ms(1), 1000);
        assert_eq!(policy.delay_ms(2), 2000);
        assert_eq!(policy.delay_ms(3), 4000);
        assert_eq!(policy.delay_ms(6), 30_000); // capped
        assert_eq!(policy.delay_ms(63), 30_000); // overflow-safe
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter_ms: 100,
            ..no_jitter()
        };
        for _ in 0..200 {
            let d = policy.delay_ms(1);
            assert!((1000..=1100).contains(&d), "delay {d} out of bounds");
        }
    }

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base_ms, 500);
        assert_eq!(policy.backoff_max_ms, 30_000);
    }
}
