//! Notification boundary used by the alert engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use caseflow_core::{TenantId, UserId};

use crate::jobs::{EnqueueOptions, JobQueue, JobStore, JobType};

/// One message to a set of tenant users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub tenant_id: TenantId,
    pub recipients: Vec<UserId>,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub metadata: JsonValue,
}

impl NotificationRequest {
    /// The `alertId` carried in `metadata`, if any.
    pub fn alert_id(&self) -> Option<&str> {
        self.metadata.get("alertId").and_then(JsonValue::as_str)
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("recipient lookup failed: {0}")]
    Recipients(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotifyError>;
}

/// Who receives ops alerts for a tenant.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipients(&self, tenant_id: TenantId) -> Result<Vec<UserId>, NotifyError>;
}

/// The same recipients for every tenant.
#[derive(Debug, Clone, Default)]
pub struct StaticRecipients(pub Vec<UserId>);

#[async_trait]
impl RecipientDirectory for StaticRecipients {
    async fn recipients(&self, _tenant_id: TenantId) -> Result<Vec<UserId>, NotifyError> {
        Ok(self.0.clone())
    }
}

/// Delivers notifications as `SEND_EMAIL` jobs on the task queue.
///
/// One job per recipient, deduplicated per alert, user and minute.
pub struct QueueingNotifier<S> {
    queue: JobQueue<S>,
}

impl<S: JobStore> QueueingNotifier<S> {
    pub fn new(queue: JobQueue<S>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl<S: JobStore + 'static> Notifier for QueueingNotifier<S> {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotifyError> {
        let minute = self.queue.clock().now().format("%Y-%m-%dT%H:%M").to_string();
        let alert = request.alert_id().unwrap_or("none").to_string();

        for user in &request.recipients {
            let payload = json!({
                "tenantId": request.tenant_id,
                "userId": user,
                "subject": request.title,
                "body": request.message,
                "actionUrl": request.action_url,
                "metadata": request.metadata,
            });
            let opts = EnqueueOptions::for_tenant(request.tenant_id)
                .with_priority(JobType::SendEmail.default_priority())
                .with_idempotency_key(format!("ops-alert/{alert}/{user}/{minute}"));
            let outcome = self
                .queue
                .enqueue(JobType::SendEmail, payload, opts)
                .await
                .map_err(|e| NotifyError::Delivery(e.to_string()))?;
            debug!(job_id = %outcome.job.id, user_id = %user, "alert email enqueued");
        }
        Ok(())
    }
}

/// Keeps every request in memory. Useful in tests and local runs.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that rejects every request.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Delivery("notifier configured to fail".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| NotifyError::Delivery("recorder lock poisoned".to_string()))?
            .push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::{InMemoryJobStore, JobQuery};

    #[tokio::test]
    async fn queueing_notifier_enqueues_one_email_per_recipient() {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::starting_now());
        let queue = JobQueue::new(Arc::clone(&store), clock);
        let notifier = QueueingNotifier::new(queue.clone());
        let tenant = TenantId::new();
        let request = NotificationRequest {
            tenant_id: tenant,
            recipients: vec![UserId::new(), UserId::new()],
            title: "Runtime alert: Queue backlog".to_string(),
            message: "due pending=250, oldest wait=-".to_string(),
            action_url: Some("/admin/ops/queue".to_string()),
            metadata: json!({ "alertId": "a-1", "alertType": "QUEUE_BACKLOG" }),
        };

        notifier.notify(request.clone()).await.unwrap();
        // Same minute: deduplicated.
        notifier.notify(request).await.unwrap();

        let jobs = queue.list_jobs(tenant, JobQuery::default()).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.job_type == JobType::SendEmail));
        assert!(jobs.iter().all(|j| {
            j.idempotency_key
                .as_deref()
                .is_some_and(|k| k.starts_with("ops-alert/a-1/"))
        }));
    }

    #[tokio::test]
    async fn recording_notifier_can_fail() {
        let notifier = RecordingNotifier::failing();
        let request = NotificationRequest {
            tenant_id: TenantId::new(),
            recipients: vec![UserId::new()],
            title: "t".to_string(),
            message: "m".to_string(),
            action_url: None,
            metadata: JsonValue::Null,
        };
        assert!(notifier.notify(request).await.is_err());
        assert!(notifier.sent().is_empty());
    }
}
