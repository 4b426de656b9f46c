//! Point-in-time queue health metrics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use caseflow_core::{DomainError, TenantId};

use crate::jobs::{JobStore, JobStoreError, LatestFailure, ProcessingAggregate};

/// Identifier of a stored metric snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a metric snapshot measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    QueueHealth,
    KanbanHealth,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::QueueHealth => "QUEUE_HEALTH",
            MetricKind::KanbanHealth => "KANBAN_HEALTH",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "QUEUE_HEALTH" => Ok(MetricKind::QueueHealth),
            "KANBAN_HEALTH" => Ok(MetricKind::KanbanHealth),
            other => Err(DomainError::unknown_variant("metric kind", other)),
        }
    }
}

/// Immutable, append-only metrics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub id: SnapshotId,
    pub tenant_id: TenantId,
    pub kind: MetricKind,
    pub captured_at: DateTime<Utc>,
    pub metrics: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Execution statistics over the trailing 24 hours.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats24h {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub p50_seconds: Option<f64>,
    pub p95_seconds: Option<f64>,
    pub avg_seconds: Option<f64>,
    /// `failed / total`, absent when nothing ran.
    pub failure_rate: Option<f64>,
}

impl From<ProcessingAggregate> for ProcessingStats24h {
    fn from(agg: ProcessingAggregate) -> Self {
        let seconds = |v: Option<f64>| v.filter(|s| s.is_finite()).map(|s| round_to(s.max(0.0), 2));
        let failure_rate = (agg.total > 0).then(|| round_to(agg.failed as f64 / agg.total as f64, 4));
        Self {
            total: agg.total,
            completed: agg.completed,
            failed: agg.failed,
            p50_seconds: seconds(agg.p50_seconds),
            p95_seconds: seconds(agg.p95_seconds),
            avg_seconds: seconds(agg.avg_seconds),
            failure_rate,
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Queue health as of `captured_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealthSnapshot {
    pub tenant_id: TenantId,
    pub captured_at: DateTime<Utc>,
    pub due_pending: u64,
    pub scheduled_pending: u64,
    pub oldest_due_pending_at: Option<DateTime<Utc>>,
    pub oldest_due_pending_age_seconds: Option<u64>,
    pub stale_processing: u64,
    #[serde(rename = "failed24h")]
    pub failed_24h: u64,
    pub latest_failure: Option<LatestFailure>,
    #[serde(rename = "processing24h")]
    pub processing_24h: ProcessingStats24h,
}

/// Reads the job store and produces [`QueueHealthSnapshot`]s.
pub struct HealthSnapshotComputer<S> {
    store: Arc<S>,
    lease_timeout: chrono::Duration,
}

impl<S> Clone for HealthSnapshotComputer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lease_timeout: self.lease_timeout,
        }
    }
}

impl<S: JobStore> HealthSnapshotComputer<S> {
    pub fn new(store: Arc<S>, lease_timeout: chrono::Duration) -> Self {
        Self { store, lease_timeout }
    }

    pub async fn compute(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<QueueHealthSnapshot, JobStoreError> {
        let counts = self
            .store
            .health_counts(
                tenant_id,
                now,
                now - self.lease_timeout,
                now - chrono::Duration::hours(24),
            )
            .await?;

        let oldest_due_pending_age_seconds = counts
            .oldest_due_pending_at
            .map(|at| u64::try_from((now - at).num_seconds()).unwrap_or(0));

        Ok(QueueHealthSnapshot {
            tenant_id,
            captured_at: now,
            due_pending: counts.due_pending,
            scheduled_pending: counts.scheduled_pending,
            oldest_due_pending_at: counts.oldest_due_pending_at,
            oldest_due_pending_age_seconds,
            stale_processing: counts.stale_processing,
            failed_24h: counts.failed_24h,
            latest_failure: counts.latest_failure,
            processing_24h: counts.processing.into(),
        })
    }
}
