//! Handler dispatch: maps a job type to the code that executes it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use super::types::{JobContext, JobType};

/// Executes one job type.
///
/// Returning `Err` schedules a retry (or fails the job once attempts run out);
/// `Ok(Some(v))` stores `v` as the job's output.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JsonValue, ctx: &JobContext) -> anyhow::Result<Option<JsonValue>>;
}

/// A handler with a typed payload, decoded once at the registry boundary.
#[async_trait]
pub trait TypedJobHandler: Send + Sync {
    type Payload: DeserializeOwned + Send;

    async fn handle(&self, payload: Self::Payload, ctx: &JobContext) -> anyhow::Result<Option<JsonValue>>;
}

struct Typed<H> {
    job_type: JobType,
    inner: H,
}

#[async_trait]
impl<H: TypedJobHandler> JobHandler for Typed<H> {
    async fn handle(&self, payload: &JsonValue, ctx: &JobContext) -> anyhow::Result<Option<JsonValue>> {
        let decoded: H::Payload =
            serde_json::from_value(payload.clone()).map_err(|e| HandlerError::InvalidPayload {
                job_type: self.job_type.to_string(),
                reason: e.to_string(),
            })?;
        self.inner.handle(decoded, ctx).await
    }
}

/// Handler dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no handler registered for job type {0}")]
    UnknownJobType(JobType),
    #[error("invalid payload for {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

/// Job type → handler lookup table, built at startup and injected into the engine.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register(&mut self, job_type: JobType, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn register_arc(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn register_typed<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: TypedJobHandler + 'static,
    {
        let typed = Typed {
            job_type: job_type.clone(),
            inner: handler,
        };
        self.register(job_type, typed)
    }

    pub fn with(mut self, job_type: JobType, handler: impl JobHandler + 'static) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &JobType> {
        self.handlers.keys()
    }

    /// Run the handler for `job_type`. Unknown types are an error, never a silent success.
    pub async fn dispatch(
        &self,
        job_type: &JobType,
        payload: &JsonValue,
        ctx: &JobContext,
    ) -> Result<Option<JsonValue>, HandlerError> {
        let handler = self
            .handlers
            .get(job_type)
            .ok_or_else(|| HandlerError::UnknownJobType(job_type.clone()))?;

        handler
            .handle(payload, ctx)
            .await
            .map_err(|e| e.downcast::<HandlerError>().unwrap_or_else(HandlerError::Failed))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(JobType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

/// Adapter so plain async closures can serve as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JsonValue, JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Option<JsonValue>>> + Send,
{
    async fn handle(&self, payload: &JsonValue, ctx: &JobContext) -> anyhow::Result<Option<JsonValue>> {
        (self.0)(payload.clone(), ctx.clone()).await
    }
}
