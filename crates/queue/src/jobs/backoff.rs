//! Retry delay computation.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Capped exponential backoff with additive jitter, in whole seconds.
///
/// `delay = min(max, base * 2^(attempts - 1)) + jitter`, where
/// `jitter ∈ [0, min(jitter_cap, max(1, delay / 10)))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter_cap_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 10,
            max_delay_secs: 30 * 60,
            jitter_cap_secs: 30,
        }
    }
}

impl BackoffPolicy {
    /// A policy without jitter, handy for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_cap_secs = 0;
        self
    }

    /// Capped exponential delay for the given attempt number (1-based), jitter excluded.
    pub fn base_delay_secs_for_attempt(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1);
        let raw = 1u64
            .checked_shl(exp)
            .and_then(|factor| self.base_delay_secs.checked_mul(factor))
            .unwrap_or(u64::MAX);
        raw.min(self.max_delay_secs)
    }

    /// Exclusive upper bound of the jitter added to `delay`.
    pub fn jitter_bound_secs(&self, delay: u64) -> u64 {
        if self.jitter_cap_secs == 0 {
            return 0;
        }
        self.jitter_cap_secs.min((delay / 10).max(1))
    }

    /// Full delay using the supplied randomness source.
    pub fn delay_secs_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> u64 {
        let delay = self.base_delay_secs_for_attempt(attempts);
        let bound = self.jitter_bound_secs(delay);
        let jitter = if bound == 0 { 0 } else { rng.gen_range(0..bound) };
        delay.saturating_add(jitter)
    }

    pub fn delay_for_attempt(&self, attempts: u32) -> chrono::Duration {
        let secs = self.delay_secs_with(attempts, &mut rand::thread_rng());
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
    }

    /// When a job that just failed its `attempts`-th attempt becomes claimable again.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay_for_attempt(attempts)
    }
}
