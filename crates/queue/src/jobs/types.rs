//! Core job types: identity, type/status enums, the job row, and process outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use caseflow_core::{DomainError, TenantId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job type, used to route a job to its handler and to its balanced-batch category.
///
/// Stored and serialized as its string form; unrecognised strings survive as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobType {
    SendEmail,
    TriggerToolWebhook,
    CleanupUploadIntents,
    QueueHealthCheck,
    KanbanHealthCheck,
    AuditLog,
    Custom(String),
}

impl JobType {
    /// Types with their own balanced-batch slot.
    pub const CATEGORIZED: [JobType; 6] = [
        JobType::CleanupUploadIntents,
        JobType::QueueHealthCheck,
        JobType::KanbanHealthCheck,
        JobType::AuditLog,
        JobType::TriggerToolWebhook,
        JobType::SendEmail,
    ];

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobType::SendEmail => "SEND_EMAIL",
            JobType::TriggerToolWebhook => "TRIGGER_TOOL_WEBHOOK",
            JobType::CleanupUploadIntents => "CLEANUP_UPLOAD_INTENTS",
            JobType::QueueHealthCheck => "QUEUE_HEALTH_CHECK",
            JobType::KanbanHealthCheck => "KANBAN_HEALTH_CHECK",
            JobType::AuditLog => "AUDIT_LOG",
            JobType::Custom(kind) => kind,
        }
    }

    /// Suggested enqueue priority (higher claims first).
    pub fn default_priority(&self) -> i32 {
        match self {
            JobType::QueueHealthCheck | JobType::KanbanHealthCheck => 100,
            JobType::CleanupUploadIntents => 50,
            JobType::AuditLog => 20,
            JobType::TriggerToolWebhook | JobType::SendEmail => 10,
            JobType::Custom(_) => 0,
        }
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SEND_EMAIL" => JobType::SendEmail,
            "TRIGGER_TOOL_WEBHOOK" => JobType::TriggerToolWebhook,
            "CLEANUP_UPLOAD_INTENTS" => JobType::CleanupUploadIntents,
            "QUEUE_HEALTH_CHECK" => JobType::QueueHealthCheck,
            "KANBAN_HEALTH_CHECK" => JobType::KanbanHealthCheck,
            "AUDIT_LOG" => JobType::AuditLog,
            _ => JobType::Custom(value),
        }
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        match value {
            JobType::Custom(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status.
///
/// `PENDING → PROCESSING → {COMPLETED | PENDING (retry) | FAILED}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::unknown_variant("job status", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Identity stamped into `locked_by` when this process claims a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `QUEUE_WORKER_ID` if set, otherwise `"{HOSTNAME}:{pid}"`.
    pub fn from_env() -> Self {
        let explicit = std::env::var("QUEUE_WORKER_ID").unwrap_or_default();
        let explicit = explicit.trim();
        if !explicit.is_empty() {
            return Self::new(explicit);
        }

        let host = std::env::var("HOSTNAME")
            .ok()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "worker".to_string());
        Self(format!("{host}:{}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A background job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Opaque payload; handlers decode it into their own typed shape.
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Earliest time the job may be claimed.
    pub available_at: DateTime<Utc>,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub idempotency_key: Option<String>,
    pub result: Option<JsonValue>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `PENDING` job.
    pub fn new(tenant_id: TenantId, job_type: JobType, payload: JsonValue, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            job_type,
            payload,
            status: JobStatus::Pending,
            available_at: now,
            priority: 0,
            attempts: 0,
            max_attempts: 1,
            locked_at: None,
            locked_by: None,
            idempotency_key: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a `PROCESSING` row's lease started strictly before `lease_expired_before`.
    pub fn is_lease_expired(&self, lease_expired_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.locked_at.is_some_and(|at| at < lease_expired_before)
    }

    /// Claim eligibility, ignoring filters.
    ///
    /// Due `PENDING` rows, or `PROCESSING` rows whose lease has expired, with attempts left.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_expired_before: DateTime<Utc>) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        match self.status {
            JobStatus::Pending => self.available_at <= now,
            JobStatus::Processing => self.is_lease_expired(lease_expired_before),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }
}

/// Optional enqueue parameters. `tenant_id` is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub tenant_id: TenantId,
    pub available_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    pub idempotency_key: Option<String>,
}

impl EnqueueOptions {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            available_at: None,
            priority: None,
            max_attempts: None,
            idempotency_key: None,
        }
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub job: Job,
    /// True when an existing row with the same idempotency key was returned instead of inserting.
    pub deduplicated: bool,
}

/// Which jobs a claim may pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessFilter {
    pub tenant_id: Option<TenantId>,
    pub job_type: Option<JobType>,
    pub exclude_types: Vec<JobType>,
}

impl ProcessFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn without_type(mut self) -> Self {
        self.job_type = None;
        self
    }

    pub fn excluding(mut self, types: impl IntoIterator<Item = JobType>) -> Self {
        for t in types {
            if !self.exclude_types.contains(&t) {
                self.exclude_types.push(t);
            }
        }
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.tenant_id.is_none_or(|t| job.tenant_id == t)
            && self.job_type.as_ref().is_none_or(|t| &job.job_type == t)
            && !self.exclude_types.contains(&job.job_type)
    }
}

/// Metadata handed to a handler alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id,
            idempotency_key: job.idempotency_key.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
        }
    }
}

/// Outcome of a single `process_next` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessOutcome {
    /// Nothing matched the filter.
    NoEligible,
    #[serde(rename_all = "camelCase")]
    Completed { job_id: JobId, job_type: JobType },
    #[serde(rename_all = "camelCase")]
    RetryScheduled {
        job_id: JobId,
        job_type: JobType,
        error: String,
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        job_id: JobId,
        job_type: JobType,
        error: String,
        attempts: u32,
    },
}

impl ProcessOutcome {
    pub fn is_processed(&self) -> bool {
        !matches!(self, ProcessOutcome::NoEligible)
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            ProcessOutcome::NoEligible => None,
            ProcessOutcome::Completed { job_id, .. }
            | ProcessOutcome::RetryScheduled { job_id, .. }
            | ProcessOutcome::Failed { job_id, .. } => Some(*job_id),
        }
    }

    pub fn job_type(&self) -> Option<&JobType> {
        match self {
            ProcessOutcome::NoEligible => None,
            ProcessOutcome::Completed { job_type, .. }
            | ProcessOutcome::RetryScheduled { job_type, .. }
            | ProcessOutcome::Failed { job_type, .. } => Some(job_type),
        }
    }
}

/// Result of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub processed: usize,
    pub results: Vec<ProcessOutcome>,
    pub per_type_processed: BTreeMap<String, usize>,
}

impl BatchResult {
    /// Append an outcome, counting it when a job was actually processed.
    pub fn record(&mut self, outcome: ProcessOutcome) {
        if let Some(job_type) = outcome.job_type() {
            *self
                .per_type_processed
                .entry(job_type.as_str().to_string())
                .or_insert(0) += 1;
            self.processed += 1;
        }
        self.results.push(outcome);
    }

    pub fn processed_of(&self, job_type: &JobType) -> usize {
        self.per_type_processed
            .get(job_type.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn has_failures(&self) -> bool {
        self.results
            .iter()
            .any(|r| matches!(r, ProcessOutcome::Failed { .. }))
    }
}
