//! Jittered exponential backoff.
//!
//! `base = initial_delay * 2^attempt`; with jitter coefficient `c` the delay
//! is drawn uniformly from `[base, base * (1 + c)]`. Pure apart from the
//! random source: never sleeps, never fails, saturates at `Duration::MAX`.

use std::time::Duration;

use helix_types::workflow::RetryPolicy;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    initial_delay: Duration,
    jitter: f64,
}

impl BackoffStrategy {
    /// Create a strategy. The jitter coefficient is clamped to `[0, 1]`;
    /// a non-finite coefficient disables jitter.
    pub fn new(initial_delay: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            initial_delay,
            jitter,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(
            Duration::from_millis(policy.initial_delay_ms),
            policy.backoff_coefficient,
        )
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Deterministic part of the delay: `initial_delay * 2^attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Delay before the retry that follows the zero-based `attempt`.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        self.get_delay_with(&mut rand::thread_rng(), attempt)
    }

    /// Same as [`get_delay`](Self::get_delay) with an explicit random source.
    pub fn get_delay_with<R: Rng + ?Sized>(&self, rng: &mut R, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 || base.is_zero() || base == Duration::MAX {
            return base;
        }

        let low = base.as_secs_f64();
        let high = low * (1.0 + self.jitter);
        let upper = Duration::try_from_secs_f64(high).unwrap_or(Duration::MAX);
        let sampled = rng.gen_range(low..=high);

        Duration::try_from_secs_f64(sampled)
            .unwrap_or(Duration::MAX)
            .clamp(base, upper.max(base))
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::from_policy(&RetryPolicy::default())
    }
}
