//! Enqueue and operator-facing job actions.

use std::sync::Arc;

use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, instrument};

use caseflow_core::{DomainError, TenantId, UserId};

use super::store::{JobQuery, JobReset, JobStats, JobStore, JobStoreError};
use super::types::{EnqueueOptions, EnqueueOutcome, Job, JobId, JobType};
use crate::clock::Clock;

/// Upper bound on operator listings.
pub const MAX_LIST_LIMIT: usize = 200;

/// Queue entry-point error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error(transparent)]
    Validation(#[from] DomainError),
}

/// Producer-side handle on the queue.
pub struct JobQueue<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    default_max_attempts: u32,
}

impl<S> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            default_max_attempts: self.default_max_attempts,
        }
    }
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_max_attempts: 8,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Insert a `PENDING` job.
    ///
    /// A duplicate `(tenant_id, idempotency_key)` returns the stored row untouched.
    #[instrument(
        skip(self, payload, opts),
        fields(tenant_id = %opts.tenant_id, job_type = %job_type),
        err
    )]
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: JsonValue,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        if job_type.as_str().trim().is_empty() {
            return Err(DomainError::validation("job type must not be empty").into());
        }

        let now = self.clock.now();
        let idempotency_key = opts
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        let mut job = Job::new(opts.tenant_id, job_type, payload, now);
        job.available_at = opts.available_at.unwrap_or(now);
        job.priority = opts.priority.unwrap_or(0);
        job.max_attempts = opts.max_attempts.unwrap_or(self.default_max_attempts).max(1);
        job.idempotency_key = idempotency_key.clone();

        match self.store.insert(job).await {
            Ok(job) => {
                debug!(job_id = %job.id, "job enqueued");
                Ok(EnqueueOutcome {
                    job,
                    deduplicated: false,
                })
            }
            Err(JobStoreError::DuplicateIdempotencyKey(key)) => {
                let existing = self
                    .store
                    .find_by_idempotency_key(opts.tenant_id, &key)
                    .await?
                    .ok_or(JobStoreError::DuplicateIdempotencyKey(key))?;
                debug!(job_id = %existing.id, "enqueue deduplicated by idempotency key");
                Ok(EnqueueOutcome {
                    job: existing,
                    deduplicated: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_job(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, QueueError> {
        match self.store.get(tenant_id, job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) | Err(JobStoreError::TenantIsolation) => Err(QueueError::JobNotFound(job_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Recent jobs, newest first.
    pub async fn list_jobs(&self, tenant_id: TenantId, query: JobQuery) -> Result<Vec<Job>, QueueError> {
        let query = JobQuery {
            limit: query.limit.clamp(1, MAX_LIST_LIMIT),
            ..query
        };
        Ok(self.store.list(tenant_id, &query).await?)
    }

    /// Put a job back to `PENDING`, due now, with a fresh attempt budget.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn requeue_job(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        actor: UserId,
    ) -> Result<Job, QueueError> {
        let job = self.get_job(tenant_id, job_id).await?;
        let now = self.clock.now();
        let result = annotate(
            job.result.as_ref(),
            [
                ("requeuedAt", json!(now)),
                ("requeuedBy", json!(actor)),
                ("previousAttempts", json!(job.attempts)),
                ("previousLastError", json!(job.last_error)),
            ],
        );
        self.reset(tenant_id, job_id, JobReset::Requeue { result }, now).await?;
        info!(actor = %actor, previous_status = job.status.as_str(), "job requeued by operator");
        self.get_job(tenant_id, job_id).await
    }

    /// Mark a job `FAILED` on operator request. Cancelled jobs are not counted as failures.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn cancel_job(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        actor: UserId,
    ) -> Result<Job, QueueError> {
        let job = self.get_job(tenant_id, job_id).await?;
        let now = self.clock.now();
        let result = annotate(
            job.result.as_ref(),
            [
                ("cancelledAt", json!(now)),
                ("cancelledBy", json!(actor)),
                ("previousAttempts", json!(job.attempts)),
                ("previousLastError", json!(job.last_error)),
            ],
        );
        self.reset(tenant_id, job_id, JobReset::Cancel { result }, now).await?;
        info!(actor = %actor, previous_status = job.status.as_str(), "job cancelled by operator");
        self.get_job(tenant_id, job_id).await
    }

    pub async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, QueueError> {
        Ok(self.store.stats(tenant_id).await?)
    }

    async fn reset(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset: JobReset,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), QueueError> {
        match self.store.reset(tenant_id, job_id, reset, now).await {
            Ok(()) => Ok(()),
            Err(JobStoreError::NotFound(_)) => Err(QueueError::JobNotFound(job_id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Merge annotations into a previous result. Non-object results are kept under `previousResult`.
fn annotate<const N: usize>(previous: Option<&JsonValue>, fields: [(&str, JsonValue); N]) -> JsonValue {
    let mut map = match previous {
        Some(JsonValue::Object(obj)) => obj.clone(),
        None | Some(JsonValue::Null) => Map::new(),
        Some(other) => {
            let mut m = Map::new();
            m.insert("previousResult".to_string(), other.clone());
            m
        }
    };
    for (k, v) in fields {
        map.insert(k.to_string(), v);
    }
    JsonValue::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobStatus;

    fn queue() -> (JobQueue<InMemoryJobStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let queue = JobQueue::new(InMemoryJobStore::arc(), Arc::new(clock.clone()));
        (queue, clock)
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let (queue, clock) = queue();
        let tenant = TenantId::new();

        let out = queue
            .enqueue(
                JobType::AuditLog,
                json!({"entity": "case"}),
                EnqueueOptions::for_tenant(tenant)
                    .with_max_attempts(0)
                    .with_idempotency_key("   "),
            )
            .await
            .unwrap();

        assert!(!out.deduplicated);
        assert_eq!(out.job.status, JobStatus::Pending);
        assert_eq!(out.job.priority, 0);
        assert_eq!(out.job.max_attempts, 1);
        assert_eq!(out.job.available_at, clock.now());
        assert_eq!(out.job.idempotency_key, None);
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_row() {
        let (queue, _clock) = queue();
        let tenant = TenantId::new();
        let opts = EnqueueOptions::for_tenant(tenant).with_idempotency_key("invoice-42");

        let first = queue
            .enqueue(JobType::SendEmail, json!({"n": 1}), opts.clone())
            .await
            .unwrap();
        let second = queue
            .enqueue(JobType::SendEmail, json!({"n": 2}), opts)
            .await
            .unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.job, first.job);
        assert_eq!(queue.stats(tenant).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn requeue_and_cancel_annotate_result() {
        let (queue, clock) = queue();
        let tenant = TenantId::new();
        let actor = UserId::new();
        let job = queue
            .enqueue(JobType::SendEmail, json!({}), EnqueueOptions::for_tenant(tenant))
            .await
            .unwrap()
            .job;

        clock.advance(chrono::Duration::minutes(3));
        let cancelled = queue.cancel_job(tenant, job.id, actor).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.last_error.as_deref(), Some(super::super::store::CANCELLED_BY_OPERATOR));
        assert_eq!(cancelled.result.as_ref().unwrap()["cancelledBy"], json!(actor));

        let requeued = queue.requeue_job(tenant, job.id, actor).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.last_error, None);
        assert_eq!(requeued.available_at, clock.now());
        let result = requeued.result.unwrap();
        assert_eq!(result["previousLastError"], json!("cancelled by operator"));
        assert!(result.get("cancelledAt").is_some());
    }

    #[tokio::test]
    async fn operator_actions_are_tenant_scoped() {
        let (queue, _clock) = queue();
        let job = queue
            .enqueue(JobType::AuditLog, json!({}), EnqueueOptions::for_tenant(TenantId::new()))
            .await
            .unwrap()
            .job;

        let other = TenantId::new();
        assert!(matches!(
            queue.cancel_job(other, job.id, UserId::new()).await,
            Err(QueueError::JobNotFound(_))
        ));
        assert!(matches!(
            queue.get_job(other, JobId::new()).await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[test]
    fn annotate_wraps_non_object_results() {
        let v = annotate(Some(&json!("done")), [("requeuedBy", json!("u"))]);
        assert_eq!(v, json!({"previousResult": "done", "requeuedBy": "u"}));
    }
}
