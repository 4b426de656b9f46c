//! Configuration loading and representation.
//!
//! Values come from the environment with sane defaults; malformed values are
//! logged and replaced by the default rather than aborting the worker.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::backoff::BackoffPolicy;
use crate::jobs::policy::{BalancedBatchPolicy, MAX_BATCH};

/// Default lease timeout after which a `PROCESSING` job is judged abandoned.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Longest lease timeout honoured; larger values are clamped.
pub const MAX_LEASE_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Queue engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a claim stays exclusive before another worker may reclaim it.
    pub lease_timeout: Duration,
    /// Upper bound on jobs per batch call (and on every per-category cap).
    pub max_batch: usize,
    /// `max_attempts` used when the enqueuer does not supply one.
    pub default_max_attempts: u32,
    /// Batch time budget used when the caller does not supply one.
    pub default_time_budget: Duration,
    /// Smallest batch time budget honoured.
    pub min_time_budget: Duration,
    /// Retry delay policy.
    pub backoff: BackoffPolicy,
    /// Default per-category caps for balanced batches.
    pub balanced: BalancedBatchPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            max_batch: MAX_BATCH,
            default_max_attempts: 8,
            default_time_budget: Duration::from_secs(20),
            min_time_budget: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
            balanced: BalancedBatchPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Load from the environment (`QUEUE_LOCK_TIMEOUT_SECONDS`, `QUEUE_DEFAULT_MAX_ATTEMPTS`).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let lease_secs = env_or("QUEUE_LOCK_TIMEOUT_SECONDS", defaults.lease_timeout.as_secs());
        let default_max_attempts = env_or("QUEUE_DEFAULT_MAX_ATTEMPTS", defaults.default_max_attempts).max(1);

        Self {
            lease_timeout: Duration::from_secs(lease_secs.max(1)).min(MAX_LEASE_TIMEOUT),
            default_max_attempts,
            ..defaults
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_balanced_policy(mut self, balanced: BalancedBatchPolicy) -> Self {
        self.balanced = balanced;
        self
    }

    /// Lease timeout as a chrono duration, for timestamp arithmetic. Clamped to [`MAX_LEASE_TIMEOUT`].
    pub fn lease_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_timeout.min(MAX_LEASE_TIMEOUT)).unwrap_or(chrono::Duration::days(30))
    }
}

/// Thresholds for the queue health alert rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertThresholds {
    pub due_pending_threshold: u64,
    pub due_pending_p0_threshold: u64,
    pub oldest_age_seconds_threshold: u64,
    pub oldest_age_seconds_p0_threshold: u64,
    pub stale_processing_threshold: u64,
    pub failed_24h_threshold: u64,
    pub notify_interval_minutes: u64,
}

/// Notifications are never repeated more often than this, whatever the config says.
pub const MIN_NOTIFY_INTERVAL_MINUTES: u64 = 5;

/// One year; longer intervals are clamped.
pub const MAX_NOTIFY_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            due_pending_threshold: 200,
            due_pending_p0_threshold: 1000,
            oldest_age_seconds_threshold: 10 * 60,
            oldest_age_seconds_p0_threshold: 60 * 60,
            stale_processing_threshold: 1,
            failed_24h_threshold: 10,
            notify_interval_minutes: 60,
        }
    }
}

impl AlertThresholds {
    /// Load from the `OPS_QUEUE_*` environment variables. Negative values are floored to 0.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            due_pending_threshold: env_count("OPS_QUEUE_DUE_PENDING_THRESHOLD", d.due_pending_threshold),
            due_pending_p0_threshold: env_count("OPS_QUEUE_DUE_PENDING_P0_THRESHOLD", d.due_pending_p0_threshold),
            oldest_age_seconds_threshold: env_count(
                "OPS_QUEUE_OLDEST_PENDING_AGE_SECONDS_THRESHOLD",
                d.oldest_age_seconds_threshold,
            ),
            oldest_age_seconds_p0_threshold: env_count(
                "OPS_QUEUE_OLDEST_PENDING_AGE_SECONDS_P0_THRESHOLD",
                d.oldest_age_seconds_p0_threshold,
            ),
            stale_processing_threshold: env_count(
                "OPS_QUEUE_STALE_PROCESSING_THRESHOLD",
                d.stale_processing_threshold,
            ),
            failed_24h_threshold: env_count("OPS_QUEUE_FAILED_24H_THRESHOLD", d.failed_24h_threshold),
            notify_interval_minutes: env_count(
                "OPS_QUEUE_ALERT_NOTIFY_INTERVAL_MINUTES",
                d.notify_interval_minutes,
            ),
        }
        .normalized()
    }

    /// Enforce the notification interval bounds.
    pub fn normalized(mut self) -> Self {
        self.notify_interval_minutes = self
            .notify_interval_minutes
            .clamp(MIN_NOTIFY_INTERVAL_MINUTES, MAX_NOTIFY_INTERVAL_MINUTES);
        self
    }

    pub fn notify_interval(&self) -> chrono::Duration {
        let minutes = self
            .notify_interval_minutes
            .clamp(MIN_NOTIFY_INTERVAL_MINUTES, MAX_NOTIFY_INTERVAL_MINUTES);
        chrono::Duration::minutes(i64::try_from(minutes).unwrap_or(365 * 24 * 60))
    }
}

/// Read and parse an environment variable, falling back to `default` when unset or malformed.
pub(crate) fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + core::fmt::Display,
{
    parse_or(name, std::env::var(name).ok().as_deref(), default)
}

/// Read a non-negative count. Negative values floor to 0; malformed ones fall back to `default`.
fn env_count(name: &str, default: u64) -> u64 {
    parse_count(name, std::env::var(name).ok().as_deref(), default)
}

fn parse_count(name: &str, raw: Option<&str>, default: u64) -> u64 {
    let fallback = i64::try_from(default).unwrap_or(i64::MAX);
    u64::try_from(parse_or(name, raw, fallback).max(0)).unwrap_or(default)
}

fn parse_or<T>(name: &str, raw: Option<&str>, default: T) -> T
where
    T: FromStr + Copy + core::fmt::Display,
{
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!(variable = name, value = raw, fallback = %default, "ignoring malformed config value");
            default
        }
    }
}
