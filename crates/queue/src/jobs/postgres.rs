//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` is one `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP LOCKED LIMIT 1) RETURNING …`
//! statement. Concurrent workers skip rows another claimer has locked instead of
//! blocking on them, so each eligible row is handed to at most one worker.
//!
//! ## Completion
//!
//! `finish` updates `WHERE id AND tenant_id AND locked_by = $worker AND status = 'PROCESSING'`.
//! Zero affected rows means the lease moved to another worker; the caller decides
//! how loudly to report it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation on insert) | `23505` | `DuplicateIdempotencyKey` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / decode | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{instrument, warn};

use caseflow_core::TenantId;

use super::store::{
    JobQuery, JobReset, JobStats, JobStore, JobStoreError, JobTransition, LatestFailure,
    ProcessingAggregate, QueueHealthCounts, CANCELLED_BY_OPERATOR,
};
use super::types::{Job, JobId, JobStatus, JobType, ProcessFilter, WorkerId};

/// DDL for `task_queue`, `ops_alerts` and `ops_metric_snapshots`. Every statement is `IF NOT EXISTS`.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_task_queue.sql");

macro_rules! job_columns {
    () => {
        "id, tenant_id, job_type, payload, status, available_at, priority, attempts, \
         max_attempts, locked_at, locked_by, idempotency_key, result, last_error, \
         created_at, updated_at"
    };
}

/// Postgres-backed job store.
///
/// Every query carries `tenant_id` in its WHERE clause except the claim, whose
/// tenant filter is optional so a shared worker can serve all tenants.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the queue and ops tables if they are missing.
    #[instrument(skip(pool), err)]
    pub async fn apply_schema(pool: &PgPool) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }

    async fn fetch_job(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode_job(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job),
        fields(tenant_id = %job.tenant_id, job_id = %job.id, job_type = %job.job_type),
        err
    )]
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let key = job.idempotency_key.clone();
        let result = sqlx::query(concat!(
            "INSERT INTO task_queue (",
            job_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             RETURNING ",
            job_columns!()
        ))
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.available_at)
        .bind(job.priority)
        .bind(to_db_int(job.attempts))
        .bind(to_db_int(job.max_attempts))
        .bind(job.locked_at)
        .bind(job.locked_by.as_deref())
        .bind(job.idempotency_key.as_deref())
        .bind(job.result.as_ref())
        .bind(job.last_error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&*self.pool)
        .await;

        match (result, key) {
            (Ok(row), _) => decode_job(&row),
            (Err(e), Some(key)) if is_unique_violation(&e) => {
                Err(JobStoreError::DuplicateIdempotencyKey(key))
            }
            (Err(e), _) => Err(map_sqlx_error("insert", e)),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let query = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM task_queue WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(key);
        self.fetch_job("find_by_idempotency_key", query).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let query = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM task_queue WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(job_id.as_uuid());
        self.fetch_job("get", query).await
    }

    #[instrument(skip(self, filter), fields(worker_id = %worker_id), err)]
    async fn claim_next(
        &self,
        filter: &ProcessFilter,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let excluded: Vec<String> = filter
            .exclude_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();

        let query = sqlx::query(concat!(
            r#"
            UPDATE task_queue
            SET status = 'PROCESSING',
                locked_at = $1,
                locked_by = $2,
                attempts = attempts + 1,
                updated_at = $1
            WHERE id = (
                SELECT id
                FROM task_queue
                WHERE attempts < max_attempts
                  AND ($3::uuid IS NULL OR tenant_id = $3::uuid)
                  AND ($4::text IS NULL OR job_type = $4::text)
                  AND NOT (job_type = ANY($5::text[]))
                  AND (
                        (status = 'PENDING' AND available_at <= $1)
                     OR (status = 'PROCESSING' AND locked_at IS NOT NULL AND locked_at < $6)
                  )
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            job_columns!()
        ))
        .bind(now)
        .bind(worker_id.as_str())
        .bind(filter.tenant_id.map(|t| *t.as_uuid()))
        .bind(filter.job_type.as_ref().map(|t| t.as_str().to_string()))
        .bind(excluded)
        .bind(lease_expired_before);

        self.fetch_job("claim_next", query).await
    }

    #[instrument(
        skip(self, transition),
        fields(tenant_id = %tenant_id, job_id = %job_id, worker_id = %worker_id),
        err
    )]
    async fn finish(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        worker_id: &WorkerId,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        const LEASE_GUARD: &str =
            "WHERE id = $1 AND tenant_id = $2 AND locked_by = $3 AND status = 'PROCESSING'";

        let query = match &transition {
            JobTransition::Complete { .. } => format!(
                "UPDATE task_queue SET status = 'COMPLETED', result = $4, last_error = NULL, \
                 updated_at = $5 {LEASE_GUARD}"
            ),
            JobTransition::Retry { .. } => format!(
                "UPDATE task_queue SET status = 'PENDING', result = $4, updated_at = $5, \
                 last_error = $6, available_at = $7, locked_at = NULL, locked_by = NULL {LEASE_GUARD}"
            ),
            JobTransition::Fail { .. } => format!(
                "UPDATE task_queue SET status = 'FAILED', result = $4, updated_at = $5, \
                 last_error = $6 {LEASE_GUARD}"
            ),
        };

        let mut q = sqlx::query(&query)
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(worker_id.as_str());
        q = match transition {
            JobTransition::Complete { result } => q.bind(result).bind(now),
            JobTransition::Retry {
                available_at,
                error,
                result,
            } => q.bind(result).bind(now).bind(error).bind(available_at),
            JobTransition::Fail { error, result } => q.bind(result).bind(now).bind(error),
        };

        let done = q
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish", e))?;
        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self, reset), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn reset(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reset: JobReset,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let q = match reset {
            JobReset::Requeue { result } => sqlx::query(
                r#"
                UPDATE task_queue
                SET status = 'PENDING', available_at = $3, attempts = 0,
                    locked_at = NULL, locked_by = NULL, last_error = NULL,
                    result = $4, updated_at = $3
                WHERE id = $1 AND tenant_id = $2
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(now)
            .bind(result),
            JobReset::Cancel { result } => sqlx::query(
                r#"
                UPDATE task_queue
                SET status = 'FAILED', locked_at = NULL, locked_by = NULL,
                    last_error = $5, result = $4, updated_at = $3
                WHERE id = $1 AND tenant_id = $2
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(now)
            .bind(result)
            .bind(CANCELLED_BY_OPERATOR),
        };

        let done = q
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset", e))?;
        if done.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, query), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM task_queue
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2::text)
              AND ($3::text IS NULL OR job_type = $3::text)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.job_type.as_ref().map(|t| t.as_str().to_string()))
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM task_queue WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = to_count(n);
            match JobStatus::parse(&status) {
                Ok(JobStatus::Pending) => stats.pending = n,
                Ok(JobStatus::Processing) => stats.processing = n,
                Ok(JobStatus::Completed) => stats.completed = n,
                Ok(JobStatus::Failed) => stats.failed = n,
                Err(e) => warn!(error = %e, "skipping unknown status in job stats"),
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn health_counts(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Result<QueueHealthCounts, JobStoreError> {
        let op = "health_counts";
        let counts = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING' AND available_at <= $2) AS due_pending,
                COUNT(*) FILTER (WHERE status = 'PENDING' AND available_at > $2) AS scheduled_pending,
                MIN(available_at) FILTER (WHERE status = 'PENDING' AND available_at <= $2) AS oldest_due_pending_at,
                COUNT(*) FILTER (WHERE status = 'PROCESSING' AND locked_at < $3) AS stale_processing,
                COUNT(*) FILTER (
                    WHERE status = 'FAILED' AND updated_at >= $4 AND last_error IS DISTINCT FROM $5
                ) AS failed_24h
            FROM task_queue
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(now)
        .bind(lease_expired_before)
        .bind(since)
        .bind(CANCELLED_BY_OPERATOR)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        let latest = sqlx::query(
            r#"
            SELECT id, job_type, updated_at, last_error
            FROM task_queue
            WHERE tenant_id = $1
              AND status = 'FAILED'
              AND updated_at >= $2
              AND last_error IS DISTINCT FROM $3
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(since)
        .bind(CANCELLED_BY_OPERATOR)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        let processing = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                percentile_cont(0.5) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (updated_at - locked_at))::float8) AS p50_seconds,
                percentile_cont(0.95) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (updated_at - locked_at))::float8) AS p95_seconds,
                AVG(EXTRACT(EPOCH FROM (updated_at - locked_at))::float8) AS avg_seconds
            FROM task_queue
            WHERE tenant_id = $1
              AND updated_at >= $2
              AND locked_at IS NOT NULL
              AND status IN ('COMPLETED', 'FAILED')
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        let get_count = |row: &sqlx::postgres::PgRow, col: &str| -> Result<u64, JobStoreError> {
            row.try_get::<i64, _>(col)
                .map(to_count)
                .map_err(|e| map_sqlx_error(op, e))
        };
        let get_secs = |col: &str| -> Result<Option<f64>, JobStoreError> {
            processing
                .try_get::<Option<f64>, _>(col)
                .map_err(|e| map_sqlx_error(op, e))
        };

        let latest_failure = match latest {
            Some(row) => Some(LatestFailure {
                job_id: JobId::from_uuid(row.try_get("id").map_err(|e| map_sqlx_error(op, e))?),
                job_type: JobType::from(
                    row.try_get::<String, _>("job_type")
                        .map_err(|e| map_sqlx_error(op, e))?,
                ),
                updated_at: row.try_get("updated_at").map_err(|e| map_sqlx_error(op, e))?,
                last_error: row.try_get("last_error").map_err(|e| map_sqlx_error(op, e))?,
            }),
            None => None,
        };

        Ok(QueueHealthCounts {
            due_pending: get_count(&counts, "due_pending")?,
            scheduled_pending: get_count(&counts, "scheduled_pending")?,
            oldest_due_pending_at: counts
                .try_get("oldest_due_pending_at")
                .map_err(|e| map_sqlx_error(op, e))?,
            stale_processing: get_count(&counts, "stale_processing")?,
            failed_24h: get_count(&counts, "failed_24h")?,
            latest_failure,
            processing: ProcessingAggregate {
                total: get_count(&processing, "total")?,
                completed: get_count(&processing, "completed")?,
                failed: get_count(&processing, "failed")?,
                p50_seconds: get_secs("p50_seconds")?,
                p95_seconds: get_secs("p95_seconds")?,
                avg_seconds: get_secs("avg_seconds")?,
            },
        })
    }
}

fn to_db_int(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn to_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    available_at: DateTime<Utc>,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    idempotency_key: Option<String>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            available_at: row.try_get("available_at")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            idempotency_key: row.try_get("idempotency_key")?,
            result: row.try_get("result")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .map_err(|e| JobStoreError::Storage(format!("invalid job row {}: {e}", row.id)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            job_type: JobType::from(row.job_type),
            payload: row.payload,
            status,
            available_at: row.available_at,
            priority: row.priority,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            idempotency_key: row.idempotency_key,
            result: row.result,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
