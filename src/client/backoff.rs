//! Reconnection delays: exponential, capped, with multiplicative jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound of the nominal delay.
    pub max: Duration,
    /// Relative jitter; 0.3 spreads each delay over ±30% of its nominal value.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.3,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base.is_zero() || self.max < self.base {
            return Err(RelayError::Configuration(
                "backoff requires 0 < base <= max".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(RelayError::Configuration(format!(
                "backoff jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// `min(base * 2^(attempt - 1), max)` for attempts counted from 1.
    pub fn nominal(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Nominal delay with random jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        self.jittered(attempt, spread)
    }

    fn jittered(&self, attempt: u32, spread: f64) -> Duration {
        let spread = spread.clamp(-self.jitter, self.jitter);
        self.nominal(attempt).mul_f64(1.0 + spread)
    }
}
