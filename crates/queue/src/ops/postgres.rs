//! Postgres-backed ops store (`ops_alerts`, `ops_metric_snapshots`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use caseflow_core::{TenantId, UserId};

use super::alert::{Alert, AlertId, AlertSeverity, AlertStatus, AlertType};
use super::snapshot::{MetricKind, MetricSnapshot, SnapshotId};
use super::store::{AlertQuery, OpsStore, OpsStoreError};

macro_rules! alert_columns {
    () => {
        "id, tenant_id, idempotency_key, alert_type, severity, status, title, message, payload, \
         first_seen_at, last_seen_at, last_notified_at, snoozed_until, acknowledged_at, \
         acknowledged_by, resolved_at, resolved_by, created_at, updated_at"
    };
}

#[derive(Debug, Clone)]
pub struct PostgresOpsStore {
    pool: Arc<PgPool>,
}

impl PostgresOpsStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OpsStore for PostgresOpsStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn find_alert_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Alert>, OpsStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            alert_columns!(),
            " FROM ops_alerts WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_alert_by_key", e))?;
        row.map(|r| decode_alert(&r)).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, alert_id = %alert_id), err)]
    async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<Alert>, OpsStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            alert_columns!(),
            " FROM ops_alerts WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(alert_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_alert", e))?;
        row.map(|r| decode_alert(&r)).transpose()
    }

    #[instrument(
        skip(self, alert),
        fields(tenant_id = %alert.tenant_id, key = %alert.idempotency_key),
        err
    )]
    async fn insert_alert(&self, alert: Alert) -> Result<Alert, OpsStoreError> {
        let result = sqlx::query(concat!(
            "INSERT INTO ops_alerts (",
            alert_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
             RETURNING ",
            alert_columns!()
        ))
        .bind(alert.id.as_uuid())
        .bind(alert.tenant_id.as_uuid())
        .bind(&alert.idempotency_key)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.payload)
        .bind(alert.first_seen_at)
        .bind(alert.last_seen_at)
        .bind(alert.last_notified_at)
        .bind(alert.snoozed_until)
        .bind(alert.acknowledged_at)
        .bind(alert.acknowledged_by.map(|u| *u.as_uuid()))
        .bind(alert.resolved_at)
        .bind(alert.resolved_by.map(|u| *u.as_uuid()))
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .fetch_one(&*self.pool)
        .await;

        match result {
            Ok(row) => decode_alert(&row),
            Err(e) if is_unique_violation(&e) => Err(OpsStoreError::DuplicateKey(alert.idempotency_key)),
            Err(e) => Err(map_sqlx_error("insert_alert", e)),
        }
    }

    #[instrument(skip(self, alert), fields(tenant_id = %alert.tenant_id, alert_id = %alert.id), err)]
    async fn update_alert(&self, alert: &Alert) -> Result<bool, OpsStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE ops_alerts
            SET alert_type = $3,
                severity = $4,
                status = $5,
                title = $6,
                message = $7,
                payload = $8,
                first_seen_at = $9,
                last_seen_at = $10,
                snoozed_until = $11,
                acknowledged_at = $12,
                acknowledged_by = $13,
                resolved_at = $14,
                resolved_by = $15,
                updated_at = $16
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(alert.id.as_uuid())
        .bind(alert.tenant_id.as_uuid())
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.payload)
        .bind(alert.first_seen_at)
        .bind(alert.last_seen_at)
        .bind(alert.snoozed_until)
        .bind(alert.acknowledged_at)
        .bind(alert.acknowledged_by.map(|u| *u.as_uuid()))
        .bind(alert.resolved_at)
        .bind(alert.resolved_by.map(|u| *u.as_uuid()))
        .bind(alert.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_alert", e))?;
        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, alert_id = %alert_id), err)]
    async fn mark_notified(
        &self,
        tenant_id: TenantId,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<(), OpsStoreError> {
        sqlx::query(
            "UPDATE ops_alerts SET last_notified_at = $3, updated_at = $3 WHERE id = $1 AND tenant_id = $2",
        )
        .bind(alert_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_notified", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_alerts(&self, tenant_id: TenantId, query: AlertQuery) -> Result<Vec<Alert>, OpsStoreError> {
        // Severity text sorts P0 < P1 < P2 < P3, which is most urgent first.
        let rows = sqlx::query(concat!(
            "SELECT ",
            alert_columns!(),
            r#"
            FROM ops_alerts
            WHERE tenant_id = $1
              AND ($2 OR status <> 'RESOLVED')
            ORDER BY severity ASC, last_seen_at DESC
            LIMIT $3
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(query.include_resolved)
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_alerts", e))?;
        rows.iter().map(decode_alert).collect()
    }

    #[instrument(
        skip(self, snapshot),
        fields(tenant_id = %snapshot.tenant_id, kind = snapshot.kind.as_str()),
        err
    )]
    async fn insert_snapshot(&self, snapshot: MetricSnapshot) -> Result<MetricSnapshot, OpsStoreError> {
        sqlx::query(
            r#"
            INSERT INTO ops_metric_snapshots (id, tenant_id, kind, captured_at, metrics, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(snapshot.id.as_uuid())
        .bind(snapshot.tenant_id.as_uuid())
        .bind(snapshot.kind.as_str())
        .bind(snapshot.captured_at)
        .bind(&snapshot.metrics)
        .bind(snapshot.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_snapshot", e))?;
        Ok(snapshot)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_snapshots(
        &self,
        tenant_id: TenantId,
        kind: MetricKind,
        limit: usize,
    ) -> Result<Vec<MetricSnapshot>, OpsStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, kind, captured_at, metrics, created_at
            FROM ops_metric_snapshots
            WHERE tenant_id = $1 AND kind = $2
            ORDER BY captured_at DESC
            LIMIT $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(kind.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_snapshots", e))?;

        rows.iter()
            .map(|row| {
                let row = SnapshotRow::from_row(row).map_err(|e| map_sqlx_error("list_snapshots", e))?;
                MetricSnapshot::try_from(row)
            })
            .collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OpsStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            OpsStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => OpsStoreError::Storage(format!("connection pool closed in {operation}")),
        _ => OpsStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn decode_alert(row: &sqlx::postgres::PgRow) -> Result<Alert, OpsStoreError> {
    let row = AlertRow::from_row(row)
        .map_err(|e| OpsStoreError::Storage(format!("failed to deserialize alert row: {e}")))?;
    Alert::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct AlertRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    idempotency_key: String,
    alert_type: String,
    severity: String,
    status: String,
    title: String,
    message: String,
    payload: serde_json::Value,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    last_notified_at: Option<DateTime<Utc>>,
    snoozed_until: Option<DateTime<Utc>>,
    acknowledged_at: Option<DateTime<Utc>>,
    acknowledged_by: Option<uuid::Uuid>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AlertRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(AlertRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            alert_type: row.try_get("alert_type")?,
            severity: row.try_get("severity")?,
            status: row.try_get("status")?,
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            payload: row.try_get("payload")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            last_notified_at: row.try_get("last_notified_at")?,
            snoozed_until: row.try_get("snoozed_until")?,
            acknowledged_at: row.try_get("acknowledged_at")?,
            acknowledged_by: row.try_get("acknowledged_by")?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<AlertRow> for Alert {
    type Error = OpsStoreError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        let invalid = |e: caseflow_core::DomainError| {
            OpsStoreError::Storage(format!("invalid alert row {}: {e}", row.id))
        };
        Ok(Alert {
            id: AlertId(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            alert_type: AlertType::parse(&row.alert_type).map_err(invalid)?,
            severity: AlertSeverity::parse(&row.severity).map_err(invalid)?,
            status: AlertStatus::parse(&row.status).map_err(invalid)?,
            idempotency_key: row.idempotency_key,
            title: row.title,
            message: row.message,
            payload: row.payload,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            last_notified_at: row.last_notified_at,
            snoozed_until: row.snoozed_until,
            acknowledged_at: row.acknowledged_at,
            acknowledged_by: row.acknowledged_by.map(UserId::from_uuid),
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by.map(UserId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct SnapshotRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    kind: String,
    captured_at: DateTime<Utc>,
    metrics: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SnapshotRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            kind: row.try_get("kind")?,
            captured_at: row.try_get("captured_at")?,
            metrics: row.try_get("metrics")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<SnapshotRow> for MetricSnapshot {
    type Error = OpsStoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let kind = MetricKind::parse(&row.kind)
            .map_err(|e| OpsStoreError::Storage(format!("invalid snapshot row {}: {e}", row.id)))?;
        Ok(MetricSnapshot {
            id: SnapshotId(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            kind,
            captured_at: row.captured_at,
            metrics: row.metrics,
            created_at: row.created_at,
        })
    }
}
