//! Batch sizing and category-fair scheduling policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::ProcessFilter;

/// Hard ceiling on jobs per batch call, and on every per-category cap.
pub const MAX_BATCH: usize = 50;

/// Per-category caps for a balanced batch.
///
/// Categories are drained in order: cleanup, health checks, audit, "other",
/// webhooks, email, then "other" again with whatever budget is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancedBatchPolicy {
    pub cleanup_max: usize,
    /// Shared by queue-health and kanban-health checks.
    pub health_max: usize,
    pub audit_max: usize,
    pub webhook_max: usize,
    pub email_max: usize,
}

impl Default for BalancedBatchPolicy {
    fn default() -> Self {
        Self {
            cleanup_max: 2,
            health_max: 2,
            audit_max: 5,
            webhook_max: 10,
            email_max: 10,
        }
    }
}

impl BalancedBatchPolicy {
    /// Apply caller overrides on top of this policy, clamping every cap to `[0, MAX_BATCH]`.
    pub fn apply(&self, overrides: &PolicyOverrides) -> Self {
        let pick = |o: Option<usize>, d: usize| o.unwrap_or(d).min(MAX_BATCH);
        Self {
            cleanup_max: pick(overrides.cleanup_max, self.cleanup_max),
            health_max: pick(overrides.health_max, self.health_max),
            audit_max: pick(overrides.audit_max, self.audit_max),
            webhook_max: pick(overrides.webhook_max, self.webhook_max),
            email_max: pick(overrides.email_max, self.email_max),
        }
    }
}

/// Optional per-category caps supplied by a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOverrides {
    pub cleanup_max: Option<usize>,
    pub health_max: Option<usize>,
    pub audit_max: Option<usize>,
    pub webhook_max: Option<usize>,
    pub email_max: Option<usize>,
}

/// Options for `process_batch` / `process_balanced_batch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub max_jobs: Option<usize>,
    pub time_budget: Option<Duration>,
    pub filter: ProcessFilter,
    /// Only consulted by balanced batches.
    pub policy: PolicyOverrides,
}

impl BatchOptions {
    pub fn new(max_jobs: usize, time_budget: Duration) -> Self {
        Self {
            max_jobs: Some(max_jobs),
            time_budget: Some(time_budget),
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: ProcessFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_policy(mut self, policy: PolicyOverrides) -> Self {
        self.policy = policy;
        self
    }

    /// Job budget clamped to `[1, max_batch]`; unset means a single job.
    pub fn effective_max_jobs(&self, max_batch: usize) -> usize {
        self.max_jobs.unwrap_or(1).clamp(1, max_batch.max(1))
    }

    /// Time budget floored at `min`; unset means `default`.
    pub fn effective_time_budget(&self, default: Duration, min: Duration) -> Duration {
        self.time_budget.unwrap_or(default).max(min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_clamped_to_batch_ceiling() {
        let policy = BalancedBatchPolicy::default().apply(&PolicyOverrides {
            cleanup_max: Some(500),
            email_max: Some(0),
            ..PolicyOverrides::default()
        });
        assert_eq!(policy.cleanup_max, MAX_BATCH);
        assert_eq!(policy.email_max, 0);
        assert_eq!(policy.health_max, 2);
        assert_eq!(policy.audit_max, 5);
        assert_eq!(policy.webhook_max, 10);
    }

    #[test]
    fn max_jobs_and_time_budget_are_normalised() {
        let default_budget = Duration::from_secs(20);
        let floor = Duration::from_millis(500);

        let opts = BatchOptions::new(0, Duration::from_millis(10));
        assert_eq!(opts.effective_max_jobs(MAX_BATCH), 1);
        assert_eq!(opts.effective_time_budget(default_budget, floor), floor);

        let opts = BatchOptions::new(1000, Duration::from_secs(3));
        assert_eq!(opts.effective_max_jobs(MAX_BATCH), MAX_BATCH);
        assert_eq!(opts.effective_time_budget(default_budget, floor), Duration::from_secs(3));

        let opts = BatchOptions::default();
        assert_eq!(opts.effective_max_jobs(MAX_BATCH), 1);
        assert_eq!(opts.effective_time_budget(default_budget, floor), default_budget);
    }
}
