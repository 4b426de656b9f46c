//! Queue engine: claim, execute, and record outcomes.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use super::handler::HandlerRegistry;
use super::policy::{BalancedBatchPolicy, BatchOptions};
use super::queue::{JobQueue, QueueError};
use super::store::{JobStore, JobTransition};
use super::types::{
    BatchResult, EnqueueOptions, EnqueueOutcome, Job, JobContext, JobType, ProcessFilter,
    ProcessOutcome, WorkerId,
};
use crate::config::QueueConfig;

/// Diagnostic stored when a reclaimed job has already used up its attempts.
pub const ATTEMPTS_EXCEEDED: &str = "exceeded max attempts (execution refused)";

/// Claims jobs and runs them through the handler registry.
///
/// Handler errors become job transitions; store errors propagate to the caller.
pub struct QueueEngine<S> {
    queue: JobQueue<S>,
    handlers: Arc<HandlerRegistry>,
    worker_id: WorkerId,
    config: QueueConfig,
}

impl<S> Clone for QueueEngine<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handlers: Arc::clone(&self.handlers),
            worker_id: self.worker_id.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: JobStore> QueueEngine<S> {
    pub fn new(
        queue: JobQueue<S>,
        handlers: HandlerRegistry,
        worker_id: WorkerId,
        config: QueueConfig,
    ) -> Self {
        let queue = queue.with_default_max_attempts(config.default_max_attempts);
        Self {
            queue,
            handlers: Arc::new(handlers),
            worker_id,
            config,
        }
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: JsonValue,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.queue.enqueue(job_type, payload, opts).await
    }

    /// Claim one eligible job and run it.
    #[instrument(skip(self, filter), fields(worker_id = %self.worker_id), err)]
    pub async fn process_next(&self, filter: &ProcessFilter) -> Result<ProcessOutcome, QueueError> {
        let now = self.queue.clock().now();
        let lease_expired_before = now - self.config.lease_timeout_chrono();

        let Some(job) = self
            .queue
            .store()
            .claim_next(filter, &self.worker_id, now, lease_expired_before)
            .await?
        else {
            return Ok(ProcessOutcome::NoEligible);
        };

        debug!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "claimed job");

        if job.attempts > job.max_attempts {
            return self.refuse_exhausted(job).await;
        }

        let ctx = JobContext::for_job(&job);
        match self.handlers.dispatch(&job.job_type, &job.payload, &ctx).await {
            Ok(output) => self.complete(job, output).await,
            Err(e) => {
                let message = e.to_string();
                let message = if message.trim().is_empty() {
                    "unknown error".to_string()
                } else {
                    message
                };
                self.fail_attempt(job, message).await
            }
        }
    }

    /// Run `process_next` until the job budget, the time budget, or the queue runs out.
    #[instrument(skip(self, opts), fields(worker_id = %self.worker_id), err)]
    pub async fn process_batch(&self, opts: BatchOptions) -> Result<BatchResult, QueueError> {
        let max_jobs = opts.effective_max_jobs(self.config.max_batch);
        let deadline = Instant::now()
            + opts.effective_time_budget(self.config.default_time_budget, self.config.min_time_budget);

        let mut batch = BatchResult::default();
        while batch.results.len() < max_jobs && Instant::now() < deadline {
            let outcome = self.process_next(&opts.filter).await?;
            let done = !outcome.is_processed();
            batch.record(outcome);
            if done {
                break;
            }
        }

        debug!(processed = batch.processed, "batch finished");
        Ok(batch)
    }

    /// Category-fair batch.
    ///
    /// Phases run in order, each capped by its policy slot and stopping at the
    /// first claim that finds nothing: cleanup, queue health then kanban health
    /// (sharing one slot), audit, other types, webhooks, email, then other types
    /// again with whatever budget is left. "Other" never includes a categorized
    /// type, so no category exceeds its slot. Any `job_type` in the caller's
    /// filter is ignored.
    #[instrument(skip(self, opts), fields(worker_id = %self.worker_id), err)]
    pub async fn process_balanced_batch(&self, opts: BatchOptions) -> Result<BatchResult, QueueError> {
        let max_jobs = opts.effective_max_jobs(self.config.max_batch);
        let deadline = Instant::now()
            + opts.effective_time_budget(self.config.default_time_budget, self.config.min_time_budget);
        let policy: BalancedBatchPolicy = self.config.balanced.apply(&opts.policy);

        let base = opts.filter.clone().without_type();
        let only = |t: JobType| base.clone().with_type(t);
        let other = base.clone().excluding(JobType::CATEGORIZED);

        let mut run = BalancedRun {
            engine: self,
            max_jobs,
            deadline,
            batch: BatchResult::default(),
        };

        run.phase(policy.cleanup_max.min(run.remaining()), &only(JobType::CleanupUploadIntents))
            .await?;

        let health_limit = policy.health_max.min(run.remaining());
        if health_limit > 0 {
            let before = run.batch.processed;
            run.phase(health_limit, &only(JobType::QueueHealthCheck)).await?;
            let used = run.batch.processed - before;
            run.phase(health_limit.saturating_sub(used), &only(JobType::KanbanHealthCheck))
                .await?;
        }

        run.phase(policy.audit_max.min(run.remaining()), &only(JobType::AuditLog))
            .await?;

        let remaining = run.remaining();
        let reserved_webhook = policy.webhook_max.min(remaining);
        let reserved_email = policy.email_max.min(remaining - reserved_webhook);
        let other_limit = remaining - reserved_webhook - reserved_email;
        run.phase(other_limit, &other).await?;

        run.phase(reserved_webhook.min(run.remaining()), &only(JobType::TriggerToolWebhook))
            .await?;
        run.phase(reserved_email.min(run.remaining()), &only(JobType::SendEmail))
            .await?;

        let leftover = run.remaining();
        run.phase(leftover, &other).await?;

        let mut batch = run.batch;
        if batch.processed == 0 {
            batch.record(ProcessOutcome::NoEligible);
        }
        debug!(processed = batch.processed, per_type = ?batch.per_type_processed, "balanced batch finished");
        Ok(batch)
    }

    async fn complete(&self, job: Job, output: Option<JsonValue>) -> Result<ProcessOutcome, QueueError> {
        let now = self.queue.clock().now();
        let mut result = Map::new();
        result.insert("success".into(), json!(true));
        result.insert("processedAt".into(), json!(now));
        result.insert("attempts".into(), json!(job.attempts));
        if let Some(output) = output {
            result.insert("output".into(), output);
        }

        let transition = JobTransition::Complete {
            result: JsonValue::Object(result),
        };
        self.finish(&job, transition, "completion").await?;
        debug!(job_id = %job.id, "job completed");

        Ok(ProcessOutcome::Completed {
            job_id: job.id,
            job_type: job.job_type,
        })
    }

    async fn fail_attempt(&self, job: Job, error: String) -> Result<ProcessOutcome, QueueError> {
        let now = self.queue.clock().now();
        let attempts = job.attempts;

        if attempts >= job.max_attempts {
            let transition = JobTransition::Fail {
                error: error.clone(),
                result: json!({ "error": error, "attempts": attempts, "failedAt": now }),
            };
            self.finish(&job, transition, "failure").await?;
            info!(job_id = %job.id, job_type = %job.job_type, attempts, error = %error, "job failed permanently");
            return Ok(ProcessOutcome::Failed {
                job_id: job.id,
                job_type: job.job_type,
                error,
                attempts,
            });
        }

        let next_run_at = self.config.backoff.next_run_at(attempts, now);
        let transition = JobTransition::Retry {
            available_at: next_run_at,
            error: error.clone(),
            result: json!({ "error": error, "attempts": attempts, "nextRunAt": next_run_at }),
        };
        self.finish(&job, transition, "retry").await?;
        debug!(job_id = %job.id, attempts, %next_run_at, error = %error, "job retry scheduled");

        Ok(ProcessOutcome::RetryScheduled {
            job_id: job.id,
            job_type: job.job_type,
            error,
            attempts,
            next_run_at,
        })
    }

    async fn refuse_exhausted(&self, job: Job) -> Result<ProcessOutcome, QueueError> {
        let now = self.queue.clock().now();
        let transition = JobTransition::Fail {
            error: ATTEMPTS_EXCEEDED.to_string(),
            result: json!({ "error": ATTEMPTS_EXCEEDED, "attempts": job.attempts, "failedAt": now }),
        };
        self.finish(&job, transition, "attempt-limit failure").await?;
        warn!(
            job_id = %job.id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            "claimed job beyond its attempt budget; not executed"
        );

        Ok(ProcessOutcome::Failed {
            job_id: job.id,
            job_type: job.job_type,
            error: ATTEMPTS_EXCEEDED.to_string(),
            attempts: job.attempts,
        })
    }

    /// Conditional write-back. Losing the lease is logged, not returned as an error.
    async fn finish(&self, job: &Job, transition: JobTransition, what: &str) -> Result<(), QueueError> {
        let now = self.queue.clock().now();
        let applied = self
            .queue
            .store()
            .finish(job.tenant_id, job.id, &self.worker_id, transition, now)
            .await?;
        if !applied {
            warn!(
                job_id = %job.id,
                worker_id = %self.worker_id,
                "{what} update skipped: lease lost or status changed"
            );
        }
        Ok(())
    }
}

struct BalancedRun<'a, S> {
    engine: &'a QueueEngine<S>,
    max_jobs: usize,
    deadline: Instant,
    batch: BatchResult,
}

impl<S: JobStore> BalancedRun<'_, S> {
    fn remaining(&self) -> usize {
        self.max_jobs.saturating_sub(self.batch.processed)
    }

    /// Process up to `limit` jobs matching `filter`; stop at the first empty claim.
    async fn phase(&mut self, limit: usize, filter: &ProcessFilter) -> Result<(), QueueError> {
        for _ in 0..limit {
            if self.remaining() == 0 || Instant::now() >= self.deadline {
                return Ok(());
            }
            let outcome = self.engine.process_next(filter).await?;
            if !outcome.is_processed() {
                return Ok(());
            }
            self.batch.record(outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::jobs::handler::FnHandler;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobStatus;
    use crate::jobs::BackoffPolicy;
    use caseflow_core::TenantId;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(handlers: HandlerRegistry) -> (QueueEngine<InMemoryJobStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let queue = JobQueue::new(InMemoryJobStore::arc(), Arc::new(clock.clone()));
        let config = QueueConfig::default().with_backoff(BackoffPolicy::default().without_jitter());
        (
            QueueEngine::new(queue, handlers, WorkerId::new("test-worker"), config),
            clock,
        )
    }

    fn ok_handler() -> FnHandler<impl Fn(JsonValue, JobContext) -> std::future::Ready<anyhow::Result<Option<JsonValue>>> + Send + Sync>
    {
        FnHandler(|_p: JsonValue, _c: JobContext| std::future::ready(Ok(None)))
    }

    #[tokio::test]
    async fn empty_queue_reports_no_eligible() {
        let (engine, _clock) = engine(HandlerRegistry::new());
        let outcome = engine.process_next(&ProcessFilter::any()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NoEligible);
    }

    #[tokio::test]
    async fn unknown_type_fails_instead_of_succeeding() {
        let (engine, _clock) = engine(HandlerRegistry::new());
        let tenant = TenantId::new();
        let job = engine
            .enqueue(
                JobType::custom("NOBODY_HANDLES_THIS"),
                json!({}),
                EnqueueOptions::for_tenant(tenant).with_max_attempts(1),
            )
            .await
            .unwrap()
            .job;

        let outcome = engine.process_next(&ProcessFilter::any()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { attempts: 1, .. }));

        let stored = engine.queue().get_job(tenant, job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("NOBODY_HANDLES_THIS"));
    }

    #[tokio::test]
    async fn failure_schedules_retry_with_backoff() {
        let handlers = HandlerRegistry::new().with(
            JobType::TriggerToolWebhook,
            FnHandler(|_p: JsonValue, _c: JobContext| async {
                Err::<Option<JsonValue>, _>(anyhow::anyhow!("502 from tool"))
            }),
        );
        let (engine, clock) = engine(handlers);
        let tenant = TenantId::new();
        let job = engine
            .enqueue(
                JobType::TriggerToolWebhook,
                json!({}),
                EnqueueOptions::for_tenant(tenant).with_max_attempts(5),
            )
            .await
            .unwrap()
            .job;

        let outcome = engine.process_next(&ProcessFilter::any()).await.unwrap();
        let expected_next = clock.now() + Duration::seconds(10);
        assert_eq!(
            outcome,
            ProcessOutcome::RetryScheduled {
                job_id: job.id,
                job_type: JobType::TriggerToolWebhook,
                error: "502 from tool".into(),
                attempts: 1,
                next_run_at: expected_next,
            }
        );

        let stored = engine.queue().get_job(tenant, job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.locked_by, None);
        assert_eq!(stored.available_at, expected_next);
        assert_eq!(stored.result.unwrap()["attempts"], json!(1));

        // Not due yet.
        assert_eq!(
            engine.process_next(&ProcessFilter::any()).await.unwrap(),
            ProcessOutcome::NoEligible
        );
    }

    #[tokio::test]
    async fn completion_stores_output() {
        let handlers = HandlerRegistry::new().with(
            JobType::AuditLog,
            FnHandler(|p: JsonValue, c: JobContext| async move {
                Ok(Some(json!({ "echo": p, "attempt": c.attempts })))
            }),
        );
        let (engine, _clock) = engine(handlers);
        let tenant = TenantId::new();
        let job = engine
            .enqueue(JobType::AuditLog, json!({"a": 1}), EnqueueOptions::for_tenant(tenant))
            .await
            .unwrap()
            .job;

        let outcome = engine.process_next(&ProcessFilter::for_tenant(tenant)).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));

        let stored = engine.queue().get_job(tenant, job.id).await.unwrap();
        let result = stored.result.unwrap();
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["output"], json!({"echo": {"a": 1}, "attempt": 1}));
        assert_eq!(stored.last_error, None);
    }

    #[tokio::test]
    async fn exhausted_job_is_refused_without_running_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handlers = HandlerRegistry::new().with(
            JobType::SendEmail,
            FnHandler(move |_p: JsonValue, _c: JobContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok::<_, anyhow::Error>(None))
            }),
        );
        let (engine, clock) = engine(handlers);
        let store = Arc::clone(engine.queue().store());
        let tenant = TenantId::new();

        // A row whose attempts already equal its ceiling and whose lease expired.
        let mut job = Job::new(tenant, JobType::SendEmail, json!({}), clock.now());
        job.status = JobStatus::Processing;
        job.max_attempts = 2;
        job.attempts = 2;
        job.locked_at = Some(clock.now() - Duration::hours(1));
        job.locked_by = Some("crashed".into());
        store.insert(job.clone()).await.unwrap();

        // Not eligible: attempts are spent.
        assert_eq!(
            engine.process_next(&ProcessFilter::any()).await.unwrap(),
            ProcessOutcome::NoEligible
        );

        // Simulate a racing reclaim that bumped attempts past the ceiling.
        let w = WorkerId::new("test-worker");
        let mut raced = Job::new(tenant, JobType::SendEmail, json!({}), clock.now());
        raced.max_attempts = 1;
        raced.attempts = 1;
        raced.status = JobStatus::Processing;
        raced.locked_at = Some(clock.now());
        raced.locked_by = Some(w.as_str().into());
        let raced = store.insert(raced).await.unwrap();
        let outcome = engine.refuse_exhausted(Job { attempts: 2, ..raced.clone() }).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                job_id: raced.id,
                job_type: JobType::SendEmail,
                error: ATTEMPTS_EXCEEDED.into(),
                attempts: 2,
            }
        );
        let stored = engine.queue().get_job(tenant, raced.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(ATTEMPTS_EXCEEDED));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_stops_at_job_budget() {
        let handlers = HandlerRegistry::new().with(JobType::AuditLog, ok_handler());
        let (engine, _clock) = engine(handlers);
        let tenant = TenantId::new();
        for _ in 0..5 {
            engine
                .enqueue(JobType::AuditLog, json!({}), EnqueueOptions::for_tenant(tenant))
                .await
                .unwrap();
        }

        let batch = engine
            .process_batch(BatchOptions::new(3, std::time::Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(batch.processed, 3);
        assert_eq!(batch.processed_of(&JobType::AuditLog), 3);

        let batch = engine
            .process_batch(BatchOptions::new(10, std::time::Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(batch.processed, 2);
        assert_eq!(batch.results.last(), Some(&ProcessOutcome::NoEligible));
    }

    #[tokio::test]
    async fn balanced_batch_reports_no_eligible_when_idle() {
        let (engine, _clock) = engine(HandlerRegistry::new());
        let batch = engine
            .process_balanced_batch(BatchOptions::new(10, std::time::Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(batch.processed, 0);
        assert_eq!(batch.results, vec![ProcessOutcome::NoEligible]);
    }

    #[tokio::test]
    async fn balanced_batch_reserves_email_and_webhook_slots() {
        let handlers = HandlerRegistry::new()
            .with(JobType::SendEmail, ok_handler())
            .with(JobType::TriggerToolWebhook, ok_handler())
            .with(JobType::custom("REINDEX"), ok_handler());
        let (engine, _clock) = engine(handlers);
        let tenant = TenantId::new();
        for t in [JobType::SendEmail, JobType::TriggerToolWebhook, JobType::custom("REINDEX")] {
            for _ in 0..10 {
                engine
                    .enqueue(t.clone(), json!({}), EnqueueOptions::for_tenant(tenant))
                    .await
                    .unwrap();
            }
        }

        let batch = engine
            .process_balanced_batch(
                BatchOptions::new(6, std::time::Duration::from_secs(5)).with_policy(
                    crate::jobs::PolicyOverrides {
                        webhook_max: Some(2),
                        email_max: Some(2),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();

        assert_eq!(batch.processed, 6);
        assert_eq!(batch.processed_of(&JobType::custom("REINDEX")), 2);
        assert_eq!(batch.processed_of(&JobType::TriggerToolWebhook), 2);
        assert_eq!(batch.processed_of(&JobType::SendEmail), 2);
    }
}
