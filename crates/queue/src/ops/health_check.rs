//! Health-check runs and operator alert actions.
//!
//! A run computes a [`QueueHealthSnapshot`], stores it, reconciles each rule
//! against its alert row, and notifies tenant recipients when allowed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use caseflow_core::{DomainError, TenantId, UserId};

use super::alert::{evaluate_rules, reconcile, should_notify, Alert, AlertCandidate, AlertId, Reconciled};
use super::notify::{NotificationRequest, Notifier, NotifyError, RecipientDirectory};
use super::snapshot::{HealthSnapshotComputer, MetricKind, MetricSnapshot, SnapshotId};
use super::store::{AlertQuery, OpsStore, OpsStoreError};
use crate::clock::Clock;
use crate::config::{AlertThresholds, DEFAULT_LEASE_TIMEOUT};
use crate::jobs::{
    EnqueueOptions, EnqueueOutcome, JobContext, JobHandler, JobQueue, JobStore, JobStoreError, JobType,
    QueueError, MAX_LIST_LIMIT,
};

/// Where alert notifications point operators.
pub const ALERT_ACTION_URL: &str = "/admin/ops/queue";

pub const MIN_SNOOZE_MINUTES: i64 = 5;
pub const MAX_SNOOZE_MINUTES: i64 = 30 * 24 * 60;

/// Attempts allowed for a queued health-check job.
const HEALTH_CHECK_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error(transparent)]
    Store(#[from] OpsStoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("alert not found: {0}")]
    AlertNotFound(AlertId),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Summary of one health-check run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub snapshot_id: SnapshotId,
    pub created_alerts: u32,
    pub updated_alerts: u32,
    pub resolved_alerts: u32,
    pub notified_alerts: u32,
    pub due_pending: u64,
    pub scheduled_pending: u64,
    pub stale_processing: u64,
    #[serde(rename = "failed24h")]
    pub failed_24h: u64,
}

/// Runs queue health checks for a job store `J` and records alerts in an ops store `O`.
pub struct HealthCheckService<J, O> {
    queue: JobQueue<J>,
    ops: Arc<O>,
    computer: HealthSnapshotComputer<J>,
    notifier: Arc<dyn Notifier>,
    recipients: Arc<dyn RecipientDirectory>,
    thresholds: AlertThresholds,
    lease_timeout: Duration,
}

impl<J: JobStore, O: OpsStore> HealthCheckService<J, O> {
    pub fn new(
        queue: JobQueue<J>,
        ops: Arc<O>,
        notifier: Arc<dyn Notifier>,
        recipients: Arc<dyn RecipientDirectory>,
    ) -> Self {
        let lease_timeout = Duration::from_std(DEFAULT_LEASE_TIMEOUT).unwrap_or(Duration::minutes(10));
        Self {
            computer: HealthSnapshotComputer::new(Arc::clone(queue.store()), lease_timeout),
            queue,
            ops,
            notifier,
            recipients,
            thresholds: AlertThresholds::default(),
            lease_timeout,
        }
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds.normalized();
        self
    }

    /// Must match the engine's lease timeout so "stale" means the same thing on both sides.
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self.computer = HealthSnapshotComputer::new(Arc::clone(self.queue.store()), lease_timeout);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.queue.clock()
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Users who receive alert notifications for `tenant_id`.
    pub async fn alert_recipients(&self, tenant_id: TenantId) -> Result<Vec<UserId>, OpsError> {
        Ok(self.recipients.recipients(tenant_id).await?)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn run_queue_health_check(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<HealthCheckResult, OpsError> {
        let snapshot = self.computer.compute(tenant_id, now).await?;
        let stored = self
            .ops
            .insert_snapshot(MetricSnapshot {
                id: SnapshotId::new(),
                tenant_id,
                kind: MetricKind::QueueHealth,
                captured_at: snapshot.captured_at,
                metrics: serde_json::to_value(&snapshot)?,
                created_at: now,
            })
            .await?;

        let recipients = match self.alert_recipients(tenant_id).await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "could not load alert recipients; skipping notifications");
                Vec::new()
            }
        };

        let mut result = HealthCheckResult {
            snapshot_id: stored.id,
            created_alerts: 0,
            updated_alerts: 0,
            resolved_alerts: 0,
            notified_alerts: 0,
            due_pending: snapshot.due_pending,
            scheduled_pending: snapshot.scheduled_pending,
            stale_processing: snapshot.stale_processing,
            failed_24h: snapshot.failed_24h,
        };

        for candidate in evaluate_rules(&snapshot, &self.thresholds, self.lease_timeout) {
            let Some((alert, fresh)) = self.apply_rule(tenant_id, &candidate, now, &mut result).await? else {
                continue;
            };
            if recipients.is_empty() || !should_notify(&alert, fresh, now, self.thresholds.notify_interval()) {
                continue;
            }
            if self.notify(&alert, &recipients, now).await {
                result.notified_alerts += 1;
            }
        }

        info!(
            snapshot_id = %result.snapshot_id,
            created = result.created_alerts,
            updated = result.updated_alerts,
            resolved = result.resolved_alerts,
            notified = result.notified_alerts,
            "queue health check finished"
        );
        Ok(result)
    }

    /// Persist what `reconcile` decided. Returns the live alert and whether it is fresh.
    async fn apply_rule(
        &self,
        tenant_id: TenantId,
        candidate: &AlertCandidate,
        now: DateTime<Utc>,
        result: &mut HealthCheckResult,
    ) -> Result<Option<(Alert, bool)>, OpsError> {
        let existing = self.ops.find_alert_by_key(tenant_id, &candidate.idempotency_key).await?;

        match reconcile(existing.as_ref(), candidate, tenant_id, now) {
            Reconciled::Unchanged => Ok(None),
            Reconciled::Resolved(alert) => {
                self.ops.update_alert(&alert).await?;
                result.resolved_alerts += 1;
                debug!(alert_id = %alert.id, key = %alert.idempotency_key, "alert resolved");
                Ok(None)
            }
            Reconciled::Updated { alert, reopened } => {
                self.ops.update_alert(&alert).await?;
                result.updated_alerts += 1;
                Ok(Some((alert, reopened)))
            }
            Reconciled::Created(alert) => match self.ops.insert_alert(alert).await {
                Ok(alert) => {
                    result.created_alerts += 1;
                    debug!(alert_id = %alert.id, key = %alert.idempotency_key, "alert opened");
                    Ok(Some((alert, true)))
                }
                Err(OpsStoreError::DuplicateKey(key)) => {
                    // A concurrent run inserted first; fold into its row.
                    let Some(winner) = self.ops.find_alert_by_key(tenant_id, &key).await? else {
                        return Ok(None);
                    };
                    match reconcile(Some(&winner), candidate, tenant_id, now) {
                        Reconciled::Updated { alert, reopened } => {
                            self.ops.update_alert(&alert).await?;
                            result.updated_alerts += 1;
                            Ok(Some((alert, reopened)))
                        }
                        _ => Ok(None),
                    }
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// `true` when the alert was delivered and stamped. Failures are logged, never returned.
    async fn notify(&self, alert: &Alert, recipients: &[UserId], now: DateTime<Utc>) -> bool {
        let request = NotificationRequest {
            tenant_id: alert.tenant_id,
            recipients: recipients.to_vec(),
            title: format!("Runtime alert: {}", alert.title),
            message: alert.message.clone(),
            action_url: Some(ALERT_ACTION_URL.to_string()),
            metadata: json!({ "alertId": alert.id, "alertType": alert.alert_type }),
        };

        if let Err(e) = self.notifier.notify(request).await {
            error!(
                alert_id = %alert.id,
                key = %alert.idempotency_key,
                error = %e,
                "alert notification failed"
            );
            return false;
        }
        if let Err(e) = self.ops.mark_notified(alert.tenant_id, alert.id, now).await {
            error!(
                alert_id = %alert.id,
                key = %alert.idempotency_key,
                error = %e,
                "failed to record alert notification"
            );
            return false;
        }
        true
    }

    /// Queue a health check for `tenant_id`. At most one per tenant per minute.
    pub async fn enqueue_queue_health_check(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, OpsError> {
        let job_type = JobType::QueueHealthCheck;
        let opts = EnqueueOptions::for_tenant(tenant_id)
            .with_priority(job_type.default_priority())
            .with_max_attempts(HEALTH_CHECK_MAX_ATTEMPTS)
            .with_idempotency_key(format!("queue-health/{}", now.format("%Y-%m-%dT%H:%M")));
        Ok(self.queue.enqueue(job_type, json!({}), opts).await?)
    }

    pub async fn list_alerts(&self, tenant_id: TenantId, query: AlertQuery) -> Result<Vec<Alert>, OpsError> {
        let query = AlertQuery {
            limit: query.limit.clamp(1, MAX_LIST_LIMIT),
            ..query
        };
        Ok(self.ops.list_alerts(tenant_id, query).await?)
    }

    pub async fn list_snapshots(
        &self,
        tenant_id: TenantId,
        kind: MetricKind,
        limit: usize,
    ) -> Result<Vec<MetricSnapshot>, OpsError> {
        Ok(self
            .ops
            .list_snapshots(tenant_id, kind, limit.clamp(1, MAX_LIST_LIMIT))
            .await?)
    }

    pub async fn acknowledge(&self, tenant_id: TenantId, alert_id: AlertId, user: UserId) -> Result<Alert, OpsError> {
        let now = self.clock().now();
        self.mutate(tenant_id, alert_id, |alert| alert.acknowledge(user, now)).await
    }

    pub async fn snooze(
        &self,
        tenant_id: TenantId,
        alert_id: AlertId,
        user: UserId,
        minutes: i64,
    ) -> Result<Alert, OpsError> {
        if !(MIN_SNOOZE_MINUTES..=MAX_SNOOZE_MINUTES).contains(&minutes) {
            return Err(DomainError::validation(format!(
                "snooze minutes must be between {MIN_SNOOZE_MINUTES} and {MAX_SNOOZE_MINUTES}, got {minutes}"
            ))
            .into());
        }
        let now = self.clock().now();
        let until = now + Duration::minutes(minutes);
        self.mutate(tenant_id, alert_id, |alert| alert.snooze(user, until, now)).await
    }

    pub async fn unsnooze(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Alert, OpsError> {
        let now = self.clock().now();
        self.mutate(tenant_id, alert_id, |alert| alert.unsnooze(now)).await
    }

    pub async fn resolve(&self, tenant_id: TenantId, alert_id: AlertId, user: UserId) -> Result<Alert, OpsError> {
        let now = self.clock().now();
        self.mutate(tenant_id, alert_id, |alert| alert.resolve(Some(user), now)).await
    }

    async fn mutate(
        &self,
        tenant_id: TenantId,
        alert_id: AlertId,
        change: impl FnOnce(&mut Alert) + Send,
    ) -> Result<Alert, OpsError> {
        let mut alert = self
            .ops
            .get_alert(tenant_id, alert_id)
            .await?
            .ok_or(OpsError::AlertNotFound(alert_id))?;
        change(&mut alert);
        if !self.ops.update_alert(&alert).await? {
            return Err(OpsError::AlertNotFound(alert_id));
        }
        info!(tenant_id = %tenant_id, alert_id = %alert_id, status = alert.status.as_str(), "alert updated by operator");
        Ok(alert)
    }
}

/// Handler for `QUEUE_HEALTH_CHECK` jobs.
pub struct QueueHealthCheckHandler<J, O> {
    service: Arc<HealthCheckService<J, O>>,
}

impl<J, O> QueueHealthCheckHandler<J, O> {
    pub fn new(service: Arc<HealthCheckService<J, O>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<J, O> JobHandler for QueueHealthCheckHandler<J, O>
where
    J: JobStore + 'static,
    O: OpsStore + 'static,
{
    async fn handle(&self, _payload: &JsonValue, ctx: &JobContext) -> anyhow::Result<Option<JsonValue>> {
        let now = self.service.clock().now();
        let result = self.service.run_queue_health_check(ctx.tenant_id, now).await?;
        Ok(Some(serde_json::to_value(result)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::{InMemoryJobStore, Job, JobStatus};
    use crate::ops::alert::{AlertStatus, BACKLOG_KEY};
    use crate::ops::notify::{RecordingNotifier, StaticRecipients};
    use crate::ops::store::InMemoryOpsStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        jobs: Arc<InMemoryJobStore>,
        ops: Arc<InMemoryOpsStore>,
        notifier: Arc<RecordingNotifier>,
        service: HealthCheckService<InMemoryJobStore, InMemoryOpsStore>,
    }

    fn fixture(notifier: RecordingNotifier, recipients: Vec<UserId>) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let jobs = InMemoryJobStore::arc();
        let ops = InMemoryOpsStore::arc();
        let notifier = Arc::new(notifier);
        let queue = JobQueue::new(Arc::clone(&jobs), clock.clone());
        let service = HealthCheckService::new(
            queue,
            Arc::clone(&ops),
            notifier.clone(),
            Arc::new(StaticRecipients(recipients)),
        );
        Fixture {
            clock,
            jobs,
            ops,
            notifier,
            service,
        }
    }

    async fn seed_pending(f: &Fixture, tenant: TenantId, n: usize) {
        let now = f.clock.now();
        for _ in 0..n {
            f.jobs
                .insert(Job::new(tenant, JobType::SendEmail, json!({}), now))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn run_stores_snapshot_and_opens_backlog_alert() {
        let f = fixture(RecordingNotifier::new(), vec![UserId::new()]);
        let tenant = TenantId::new();
        seed_pending(&f, tenant, 250).await;

        let result = f.service.run_queue_health_check(tenant, f.clock.now()).await.unwrap();
        assert_eq!(result.due_pending, 250);
        assert_eq!(result.created_alerts, 1);
        assert_eq!(result.notified_alerts, 1);

        let snapshots = f.service.list_snapshots(tenant, MetricKind::QueueHealth, 10).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, result.snapshot_id);
        assert_eq!(snapshots[0].metrics["duePending"], json!(250));

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Runtime alert: Queue backlog");
        assert_eq!(sent[0].action_url.as_deref(), Some(ALERT_ACTION_URL));
        assert_eq!(sent[0].metadata["alertType"], json!("QUEUE_BACKLOG"));

        let alert = f.ops.find_alert_by_key(tenant, BACKLOG_KEY).await.unwrap().unwrap();
        assert_eq!(alert.last_notified_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn no_recipients_means_no_notification() {
        let f = fixture(RecordingNotifier::new(), Vec::new());
        let tenant = TenantId::new();
        seed_pending(&f, tenant, 250).await;

        let result = f.service.run_queue_health_check(tenant, f.clock.now()).await.unwrap();
        assert_eq!(result.created_alerts, 1);
        assert_eq!(result.notified_alerts, 0);
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_notification_keeps_alert_state() {
        let f = fixture(RecordingNotifier::failing(), vec![UserId::new()]);
        let tenant = TenantId::new();
        seed_pending(&f, tenant, 250).await;

        let result = f.service.run_queue_health_check(tenant, f.clock.now()).await.unwrap();
        assert_eq!(result.created_alerts, 1);
        assert_eq!(result.notified_alerts, 0);

        let alert = f.ops.find_alert_by_key(tenant, BACKLOG_KEY).await.unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Open);
        assert_eq!(alert.last_notified_at, None);
    }

    /// Delegates to the in-memory store but cannot record notifications.
    struct StampFailingOps(InMemoryOpsStore);

    #[async_trait]
    impl OpsStore for StampFailingOps {
        async fn find_alert_by_key(&self, tenant_id: TenantId, key: &str) -> Result<Option<Alert>, OpsStoreError> {
            self.0.find_alert_by_key(tenant_id, key).await
        }

        async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<Alert>, OpsStoreError> {
            self.0.get_alert(tenant_id, alert_id).await
        }

        async fn insert_alert(&self, alert: Alert) -> Result<Alert, OpsStoreError> {
            self.0.insert_alert(alert).await
        }

        async fn update_alert(&self, alert: &Alert) -> Result<bool, OpsStoreError> {
            self.0.update_alert(alert).await
        }

        async fn mark_notified(&self, _: TenantId, _: AlertId, _: DateTime<Utc>) -> Result<(), OpsStoreError> {
            Err(OpsStoreError::Storage("connection reset".to_string()))
        }

        async fn list_alerts(&self, tenant_id: TenantId, query: AlertQuery) -> Result<Vec<Alert>, OpsStoreError> {
            self.0.list_alerts(tenant_id, query).await
        }

        async fn insert_snapshot(&self, snapshot: MetricSnapshot) -> Result<MetricSnapshot, OpsStoreError> {
            self.0.insert_snapshot(snapshot).await
        }

        async fn list_snapshots(
            &self,
            tenant_id: TenantId,
            kind: MetricKind,
            limit: usize,
        ) -> Result<Vec<MetricSnapshot>, OpsStoreError> {
            self.0.list_snapshots(tenant_id, kind, limit).await
        }
    }

    #[tokio::test]
    async fn stamp_failure_does_not_abort_remaining_alerts() {
        let clock = Arc::new(ManualClock::starting_now());
        let jobs = InMemoryJobStore::arc();
        let ops = Arc::new(StampFailingOps(InMemoryOpsStore::new()));
        let notifier = Arc::new(RecordingNotifier::new());
        let service = HealthCheckService::new(
            JobQueue::new(Arc::clone(&jobs), clock.clone()),
            Arc::clone(&ops),
            notifier.clone(),
            Arc::new(StaticRecipients(vec![UserId::new()])),
        );
        let tenant = TenantId::new();
        let now = clock.now();
        for _ in 0..250 {
            jobs.insert(Job::new(tenant, JobType::SendEmail, json!({}), now)).await.unwrap();
        }
        for _ in 0..10 {
            let mut failed = Job::new(tenant, JobType::SendEmail, json!({}), now);
            failed.status = JobStatus::Failed;
            failed.last_error = Some("smtp down".into());
            jobs.insert(failed).await.unwrap();
        }

        let result = service.run_queue_health_check(tenant, now).await.unwrap();
        assert_eq!(result.created_alerts, 2);
        assert_eq!(result.notified_alerts, 0);
        assert_eq!(notifier.sent().len(), 2);

        let alerts = ops.list_alerts(tenant, AlertQuery::default()).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.last_notified_at.is_none()));
    }

    #[tokio::test]
    async fn operator_actions_validate_and_scope() {
        let f = fixture(RecordingNotifier::new(), Vec::new());
        let tenant = TenantId::new();
        seed_pending(&f, tenant, 250).await;
        f.service.run_queue_health_check(tenant, f.clock.now()).await.unwrap();
        let alert = f.ops.find_alert_by_key(tenant, BACKLOG_KEY).await.unwrap().unwrap();
        let user = UserId::new();

        let err = f.service.snooze(tenant, alert.id, user, 4).await.unwrap_err();
        assert!(matches!(err, OpsError::Validation(_)));
        let err = f.service.snooze(tenant, alert.id, user, 43_201).await.unwrap_err();
        assert!(matches!(err, OpsError::Validation(_)));

        let snoozed = f.service.snooze(tenant, alert.id, user, 30).await.unwrap();
        assert_eq!(snoozed.status, AlertStatus::Snoozed);
        assert_eq!(snoozed.snoozed_until, Some(f.clock.now() + Duration::minutes(30)));
        assert_eq!(snoozed.acknowledged_by, Some(user));

        let open = f.service.unsnooze(tenant, alert.id).await.unwrap();
        assert_eq!(open.status, AlertStatus::Open);

        let resolved = f.service.resolve(tenant, alert.id, user).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.resolved_by, Some(user));

        let err = f.service.acknowledge(TenantId::new(), alert.id, user).await.unwrap_err();
        assert!(matches!(err, OpsError::AlertNotFound(id) if id == alert.id));
    }

    #[tokio::test]
    async fn health_check_jobs_are_deduplicated_per_minute() {
        let f = fixture(RecordingNotifier::new(), Vec::new());
        let tenant = TenantId::new();
        let now = f.clock.now();

        let first = f.service.enqueue_queue_health_check(tenant, now).await.unwrap();
        let second = f.service.enqueue_queue_health_check(tenant, now).await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(first.job.priority, 100);
        assert_eq!(first.job.max_attempts, 3);
        assert_eq!(first.job.status, JobStatus::Pending);

        let next_minute = f.service.enqueue_queue_health_check(tenant, now + Duration::minutes(1)).await.unwrap();
        assert!(!next_minute.deduplicated);
    }

    #[tokio::test]
    async fn handler_returns_run_summary() {
        let f = fixture(RecordingNotifier::new(), Vec::new());
        let tenant = TenantId::new();
        let handler = QueueHealthCheckHandler::new(Arc::new(f.service));
        let job = Job::new(tenant, JobType::QueueHealthCheck, json!({}), f.clock.now());

        let output = handler.handle(&json!({}), &JobContext::for_job(&job)).await.unwrap().unwrap();
        assert_eq!(output["duePending"], json!(0));
        assert_eq!(output["createdAlerts"], json!(0));
        assert!(output["snapshotId"].is_string());
    }
}
