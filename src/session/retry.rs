// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Retry policy for idempotent requests.

use rand::Rng;
use reqwest::Method;
use std::time::Duration;

/// Exponential backoff with jitter.
///
/// Delay before retry `n` (zero-based) is `base * factor^n`, scaled by a
/// random factor within `1 ± jitter`. Defaults give 100 ms, 400 ms, and 1.6 s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub retries: u32,

    /// Delay before first retry.
    pub base_delay: Duration,

    /// Multiplier applied to the delay after each retry.
    pub factor: u32,

    /// Relative jitter applied to each delay.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Only idempotent verbs are worth retrying.
    pub fn applies_to(&self, method: &Method) -> bool {
        self.retries > 0 && (*method == Method::GET || *method == Method::HEAD)
    }

    /// Delay before retry of given zero-based index, without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(retry))
    }

    /// Delay before retry of given zero-based index, with jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter <= 0.0 {
            return nominal;
        }

        let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        nominal.mul_f64(scale.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(100),
            factor: 4,
            jitter: 0.25,
        }
    }
}
