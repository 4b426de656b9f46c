//! Alert and metric snapshot storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use caseflow_core::TenantId;

use super::alert::{Alert, AlertId, AlertStatus};
use super::snapshot::{MetricKind, MetricSnapshot};

/// Alert listing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertQuery {
    pub include_resolved: bool,
    pub limit: usize,
}

impl Default for AlertQuery {
    fn default() -> Self {
        Self {
            include_resolved: false,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OpsStoreError {
    #[error("alert already exists for key {0}")]
    DuplicateKey(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence for alerts and metric snapshots. Every call is tenant-scoped.
#[async_trait]
pub trait OpsStore: Send + Sync {
    async fn find_alert_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Alert>, OpsStoreError>;

    async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<Alert>, OpsStoreError>;

    /// Insert a new alert; a clash on `(tenant_id, idempotency_key)` is [`OpsStoreError::DuplicateKey`].
    async fn insert_alert(&self, alert: Alert) -> Result<Alert, OpsStoreError>;

    /// Overwrite the mutable fields of an existing alert. `false` if the row is gone.
    async fn update_alert(&self, alert: &Alert) -> Result<bool, OpsStoreError>;

    async fn mark_notified(
        &self,
        tenant_id: TenantId,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<(), OpsStoreError>;

    /// Most urgent first, then most recently seen.
    async fn list_alerts(&self, tenant_id: TenantId, query: AlertQuery) -> Result<Vec<Alert>, OpsStoreError>;

    async fn insert_snapshot(&self, snapshot: MetricSnapshot) -> Result<MetricSnapshot, OpsStoreError>;

    /// Newest first.
    async fn list_snapshots(
        &self,
        tenant_id: TenantId,
        kind: MetricKind,
        limit: usize,
    ) -> Result<Vec<MetricSnapshot>, OpsStoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    alerts: HashMap<AlertId, Alert>,
    snapshots: Vec<MetricSnapshot>,
}

/// In-memory ops store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOpsStore {
    tables: Mutex<Tables>,
}

impl InMemoryOpsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, OpsStoreError> {
        self.tables
            .lock()
            .map_err(|_| OpsStoreError::Storage("ops store lock poisoned".to_string()))
    }
}

#[async_trait]
impl OpsStore for InMemoryOpsStore {
    async fn find_alert_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Alert>, OpsStoreError> {
        let t = self.lock()?;
        Ok(t.alerts
            .values()
            .find(|a| a.tenant_id == tenant_id && a.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<Alert>, OpsStoreError> {
        let t = self.lock()?;
        Ok(t.alerts
            .get(&alert_id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn insert_alert(&self, alert: Alert) -> Result<Alert, OpsStoreError> {
        let mut t = self.lock()?;
        let clash = t
            .alerts
            .values()
            .any(|a| a.tenant_id == alert.tenant_id && a.idempotency_key == alert.idempotency_key);
        if clash {
            return Err(OpsStoreError::DuplicateKey(alert.idempotency_key));
        }
        t.alerts.insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn update_alert(&self, alert: &Alert) -> Result<bool, OpsStoreError> {
        let mut t = self.lock()?;
        match t.alerts.get_mut(&alert.id) {
            Some(stored) if stored.tenant_id == alert.tenant_id => {
                let created_at = stored.created_at;
                let last_notified_at = stored.last_notified_at;
                *stored = alert.clone();
                stored.created_at = created_at;
                stored.last_notified_at = last_notified_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_notified(
        &self,
        tenant_id: TenantId,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<(), OpsStoreError> {
        let mut t = self.lock()?;
        if let Some(alert) = t.alerts.get_mut(&alert_id).filter(|a| a.tenant_id == tenant_id) {
            alert.last_notified_at = Some(at);
            alert.updated_at = at;
        }
        Ok(())
    }

    async fn list_alerts(&self, tenant_id: TenantId, query: AlertQuery) -> Result<Vec<Alert>, OpsStoreError> {
        let t = self.lock()?;
        let mut alerts: Vec<Alert> = t
            .alerts
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .filter(|a| query.include_resolved || a.status != AlertStatus::Resolved)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.last_seen_at.cmp(&a.last_seen_at))
        });
        alerts.truncate(query.limit);
        Ok(alerts)
    }

    async fn insert_snapshot(&self, snapshot: MetricSnapshot) -> Result<MetricSnapshot, OpsStoreError> {
        let mut t = self.lock()?;
        t.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn list_snapshots(
        &self,
        tenant_id: TenantId,
        kind: MetricKind,
        limit: usize,
    ) -> Result<Vec<MetricSnapshot>, OpsStoreError> {
        let t = self.lock()?;
        let mut snapshots: Vec<MetricSnapshot> = t
            .snapshots
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.kind == kind)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        snapshots.truncate(limit);
        Ok(snapshots)
    }
}
