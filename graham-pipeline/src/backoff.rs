//! Retry spacing.
//!
//! A failed attempt `n` waits `base * 2^(n-1)`, capped at the configured
//! maximum, then spread by a symmetric random jitter so retries from one
//! batch do not hit the source in lockstep. The policy holds no state: the
//! attempt number travels on the task, so every worker shares one copy.

use rand::Rng;
use std::time::Duration;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    base: Duration,
    max_delay: Duration,
    /// Fraction of the capped delay, in `[0, 1]`
    jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RetryBackoff {
    /// `jitter` outside `[0, 1]` is clamped; NaN disables it.
    pub fn new(base: Duration, max_delay: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        Self {
            base,
            max_delay: max_delay.max(base),
            jitter,
        }
    }

    /// Policy from the `retry_backoff_*` and `retry_jitter_factor` settings.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_backoff_base_ms),
            Duration::from_millis(config.retry_backoff_max_ms),
            config.retry_jitter_factor,
        )
    }

    /// Wait before retrying after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter == 0.0 || ceiling.is_zero() {
            return ceiling;
        }

        let spread = rng.gen_range(-self.jitter..=self.jitter);
        ceiling.mul_f64(1.0 + spread)
    }

    /// Un-jittered wait for `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}
