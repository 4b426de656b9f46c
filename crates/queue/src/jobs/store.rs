//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use caseflow_core::TenantId;

use super::types::{Job, JobId, JobStatus, JobType, ProcessFilter, WorkerId};

/// `last_error` stamped on jobs an operator cancelled; such jobs do not count as failures.
pub const CANCELLED_BY_OPERATOR: &str = "cancelled by operator";

/// How a worker that holds the lease leaves `PROCESSING`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// `COMPLETED`, lease metadata kept for duration metrics.
    Complete { result: JsonValue },
    /// Back to `PENDING` at `available_at`, lease cleared.
    Retry {
        available_at: DateTime<Utc>,
        error: String,
        result: JsonValue,
    },
    /// Terminal `FAILED`, lease metadata kept for forensics.
    Fail { error: String, result: JsonValue },
}

/// Operator-driven reset, applied regardless of lease ownership.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReset {
    /// `PENDING`, due now, attempts and error cleared.
    Requeue { result: JsonValue },
    /// `FAILED` with [`CANCELLED_BY_OPERATOR`].
    Cancel { result: JsonValue },
}

/// Listing query for operator views. Results are newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: usize,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 50,
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// The most recent non-cancelled failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestFailure {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Duration aggregate over terminal jobs that were ever locked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingAggregate {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub p50_seconds: Option<f64>,
    pub p95_seconds: Option<f64>,
    pub avg_seconds: Option<f64>,
}

impl ProcessingAggregate {
    /// Aggregate `(status, seconds)` samples the same way Postgres `percentile_cont` does.
    pub fn from_samples(samples: impl IntoIterator<Item = (JobStatus, f64)>) -> Self {
        let mut agg = Self::default();
        let mut durations = Vec::new();
        for (status, secs) in samples {
            agg.total += 1;
            match status {
                JobStatus::Completed => agg.completed += 1,
                JobStatus::Failed => agg.failed += 1,
                JobStatus::Pending | JobStatus::Processing => {}
            }
            durations.push(secs);
        }
        if durations.is_empty() {
            return agg;
        }
        durations.sort_by(f64::total_cmp);
        agg.p50_seconds = Some(percentile_cont(&durations, 0.5));
        agg.p95_seconds = Some(percentile_cont(&durations, 0.95));
        agg.avg_seconds = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        agg
    }
}

/// Linear interpolation between closest ranks; `sorted` must be non-empty.
fn percentile_cont(sorted: &[f64], fraction: f64) -> f64 {
    let pos = fraction * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Raw figures behind a queue health snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueHealthCounts {
    pub due_pending: u64,
    pub scheduled_pending: u64,
    pub oldest_due_pending_at: Option<DateTime<Utc>>,
    pub stale_processing: u64,
    pub failed_24h: u64,
    pub latest_failure: Option<LatestFailure>,
    pub processing: ProcessingAggregate,
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job store abstraction.
///
/// Every mutation is a single conditional operation so concurrent workers
/// coordinate through the store alone.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. A clash on `(tenant_id, idempotency_key)` yields
    /// [`JobStoreError::DuplicateIdempotencyKey`].
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim the best eligible job: mark it `PROCESSING`, stamp the
    /// lease, bump `attempts`, and return it.
    async fn claim_next(
        &self,
        filter: &ProcessFilter,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Apply `transition` only if `worker_id` still holds the job in `PROCESSING`.
    ///
    /// Returns `false` when the lease was lost.
    async fn finish(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        worker_id: &WorkerId,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    async fn reset(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset: JobReset,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    async fn list(&self, tenant_id: TenantId, query: &JobQuery) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;

    async fn health_counts(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Result<QueueHealthCounts, JobStoreError>;
}

/// In-memory job store for tests/dev.
///
/// All operations run under one mutex, which gives claims the same
/// at-most-once guarantee the SQL claim has.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

fn is_operator_cancel(job: &Job) -> bool {
    job.last_error.as_deref() == Some(CANCELLED_BY_OPERATOR)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.lock()?;
        if let Some(key) = job.idempotency_key.as_deref() {
            let clash = jobs
                .values()
                .any(|j| j.tenant_id == job.tenant_id && j.idempotency_key.as_deref() == Some(key));
            if clash {
                return Err(JobStoreError::DuplicateIdempotencyKey(key.to_string()));
            }
        }
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::Storage(format!("job already exists: {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.lock()?;
        Ok(jobs
            .values()
            .find(|j| j.tenant_id == tenant_id && j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.lock()?;
        match jobs.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn claim_next(
        &self,
        filter: &ProcessFilter,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.lock()?;

        let next = jobs
            .values()
            .filter(|j| filter.matches(j) && j.is_claimable(now, lease_expired_before))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.0.cmp(&b.id.0))
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.locked_at = Some(now);
        job.locked_by = Some(worker_id.as_str().to_string());
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn finish(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        worker_id: &WorkerId,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.lock()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        let holds_lease = job.tenant_id == tenant_id
            && job.status == JobStatus::Processing
            && job.locked_by.as_deref() == Some(worker_id.as_str());
        if !holds_lease {
            return Ok(false);
        }

        match transition {
            JobTransition::Complete { result } => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.last_error = None;
            }
            JobTransition::Retry {
                available_at,
                error,
                result,
            } => {
                job.status = JobStatus::Pending;
                job.available_at = available_at;
                job.locked_at = None;
                job.locked_by = None;
                job.last_error = Some(error);
                job.result = Some(result);
            }
            JobTransition::Fail { error, result } => {
                job.status = JobStatus::Failed;
                job.last_error = Some(error);
                job.result = Some(result);
            }
        }
        job.updated_at = now;
        Ok(true)
    }

    async fn reset(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset: JobReset,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        match reset {
            JobReset::Requeue { result } => {
                job.status = JobStatus::Pending;
                job.available_at = now;
                job.attempts = 0;
                job.last_error = None;
                job.result = Some(result);
            }
            JobReset::Cancel { result } => {
                job.status = JobStatus::Failed;
                job.last_error = Some(CANCELLED_BY_OPERATOR.to_string());
                job.result = Some(result);
            }
        }
        Ok(())
    }

    async fn list(&self, tenant_id: TenantId, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.lock()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && query.status.is_none_or(|s| j.status == s)
                    && query.job_type.as_ref().is_none_or(|t| &j.job_type == t)
            })
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.0.cmp(&a.id.0)));
        result.truncate(query.limit);
        Ok(result)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.lock()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn health_counts(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Result<QueueHealthCounts, JobStoreError> {
        let jobs = self.lock()?;
        let mut counts = QueueHealthCounts::default();
        let mut samples = Vec::new();

        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match job.status {
                JobStatus::Pending if job.available_at <= now => {
                    counts.due_pending += 1;
                    counts.oldest_due_pending_at = Some(
                        counts
                            .oldest_due_pending_at
                            .map_or(job.available_at, |at| at.min(job.available_at)),
                    );
                }
                JobStatus::Pending => counts.scheduled_pending += 1,
                JobStatus::Processing => {
                    if job.is_lease_expired(lease_expired_before) {
                        counts.stale_processing += 1;
                    }
                }
                JobStatus::Failed if job.updated_at >= since && !is_operator_cancel(job) => {
                    counts.failed_24h += 1;
                    let newer = counts
                        .latest_failure
                        .as_ref()
                        .is_none_or(|f| job.updated_at > f.updated_at);
                    if newer {
                        counts.latest_failure = Some(LatestFailure {
                            job_id: job.id,
                            job_type: job.job_type.clone(),
                            updated_at: job.updated_at,
                            last_error: job.last_error.clone(),
                        });
                    }
                }
                JobStatus::Completed | JobStatus::Failed => {}
            }

            if job.status.is_terminal() && job.updated_at >= since {
                if let Some(locked_at) = job.locked_at {
                    let secs = (job.updated_at - locked_at).num_milliseconds() as f64 / 1000.0;
                    samples.push((job.status, secs));
                }
            }
        }

        counts.processing = ProcessingAggregate::from_samples(samples);
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn pending(tenant: TenantId, job_type: JobType, now: DateTime<Utc>) -> Job {
        let mut job = Job::new(tenant, job_type, json!({}), now);
        job.max_attempts = 3;
        job
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected_per_tenant() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let tenant = TenantId::new();

        let mut first = pending(tenant, JobType::SendEmail, now);
        first.idempotency_key = Some("k".into());
        store.insert(first).await.unwrap();

        let mut dup = pending(tenant, JobType::SendEmail, now);
        dup.idempotency_key = Some("k".into());
        assert!(matches!(
            store.insert(dup).await,
            Err(JobStoreError::DuplicateIdempotencyKey(_))
        ));

        let mut other_tenant = pending(TenantId::new(), JobType::SendEmail, now);
        other_tenant.idempotency_key = Some("k".into());
        assert!(store.insert(other_tenant).await.is_ok());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let tenant = TenantId::new();
        let worker = WorkerId::new("w1");

        let old_low = pending(tenant, JobType::AuditLog, now - Duration::seconds(30));
        let mut new_high = pending(tenant, JobType::SendEmail, now);
        new_high.priority = 10;
        let mut old_high = pending(tenant, JobType::TriggerToolWebhook, now - Duration::seconds(5));
        old_high.priority = 10;

        for j in [old_low.clone(), new_high.clone(), old_high.clone()] {
            store.insert(j).await.unwrap();
        }

        let cutoff = now - Duration::minutes(10);
        let filter = ProcessFilter::for_tenant(tenant);
        let order: Vec<JobId> = [
            store.claim_next(&filter, &worker, now, cutoff).await.unwrap(),
            store.claim_next(&filter, &worker, now, cutoff).await.unwrap(),
            store.claim_next(&filter, &worker, now, cutoff).await.unwrap(),
        ]
        .into_iter()
        .map(|j| j.unwrap().id)
        .collect();

        assert_eq!(order, vec![old_high.id, new_high.id, old_low.id]);
        assert!(store.claim_next(&filter, &worker, now, cutoff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finish_requires_matching_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let tenant = TenantId::new();
        let job = store.insert(pending(tenant, JobType::AuditLog, now)).await.unwrap();

        let owner = WorkerId::new("owner");
        let intruder = WorkerId::new("intruder");
        store
            .claim_next(&ProcessFilter::any(), &owner, now, now - Duration::minutes(10))
            .await
            .unwrap();

        let done = JobTransition::Complete { result: json!({"success": true}) };
        assert!(!store.finish(tenant, job.id, &intruder, done.clone(), now).await.unwrap());
        assert!(store.finish(tenant, job.id, &owner, done.clone(), now).await.unwrap());
        // Already terminal.
        assert!(!store.finish(tenant, job.id, &owner, done, now).await.unwrap());

        let stored = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.locked_by.as_deref(), Some("owner"));
    }

    #[tokio::test]
    async fn get_rejects_cross_tenant_access() {
        let store = InMemoryJobStore::new();
        let job = store
            .insert(pending(TenantId::new(), JobType::AuditLog, Utc::now()))
            .await
            .unwrap();
        assert!(matches!(
            store.get(TenantId::new(), job.id).await,
            Err(JobStoreError::TenantIsolation)
        ));
    }

    #[tokio::test]
    async fn health_counts_skip_operator_cancellations() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let tenant = TenantId::new();

        let mut failed = pending(tenant, JobType::SendEmail, now - Duration::minutes(5));
        failed.status = JobStatus::Failed;
        failed.locked_at = Some(now - Duration::minutes(5));
        failed.updated_at = now - Duration::minutes(4);
        failed.last_error = Some("smtp down".into());

        let mut cancelled = pending(tenant, JobType::SendEmail, now);
        cancelled.status = JobStatus::Failed;
        cancelled.last_error = Some(CANCELLED_BY_OPERATOR.into());

        let mut stale = pending(tenant, JobType::AuditLog, now);
        stale.status = JobStatus::Processing;
        stale.locked_at = Some(now - Duration::minutes(30));
        stale.locked_by = Some("gone".into());

        let scheduled = {
            let mut j = pending(tenant, JobType::AuditLog, now);
            j.available_at = now + Duration::hours(1);
            j
        };
        let due = pending(tenant, JobType::AuditLog, now - Duration::minutes(2));

        for j in [failed.clone(), cancelled, stale, scheduled, due.clone()] {
            store.insert(j).await.unwrap();
        }

        let counts = store
            .health_counts(
                tenant,
                now,
                now - Duration::minutes(10),
                now - Duration::hours(24),
            )
            .await
            .unwrap();

        assert_eq!(counts.due_pending, 1);
        assert_eq!(counts.scheduled_pending, 1);
        assert_eq!(counts.oldest_due_pending_at, Some(due.available_at));
        assert_eq!(counts.stale_processing, 1);
        assert_eq!(counts.failed_24h, 1);
        assert_eq!(counts.latest_failure.map(|f| f.job_id), Some(failed.id));
        assert_eq!(counts.processing.total, 1);
        assert_eq!(counts.processing.failed, 1);
        assert_eq!(counts.processing.p50_seconds, Some(60.0));
    }

    #[test]
    fn percentiles_interpolate_like_postgres() {
        let agg = ProcessingAggregate::from_samples(
            [1.0, 2.0, 3.0, 4.0].map(|s| (JobStatus::Completed, s)),
        );
        assert_eq!(agg.total, 4);
        assert_eq!(agg.p50_seconds, Some(2.5));
        assert!((agg.p95_seconds.unwrap() - 3.85).abs() < 1e-9);
        assert_eq!(agg.avg_seconds, Some(2.5));

        let empty = ProcessingAggregate::from_samples(std::iter::empty());
        assert_eq!(empty.total, 0);
        assert_eq!(empty.p50_seconds, None);
    }
}
