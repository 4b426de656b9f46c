//! Durable background job queue.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and typed; payloads stay opaque JSON until a handler decodes them
//! - Claims are exclusive leases; an expired lease makes the job claimable again
//! - Failed attempts retry with capped exponential backoff and jitter
//! - Enqueue is idempotent per `(tenant, idempotency_key)`
//! - Balanced batches cap each job category so one flood cannot starve the rest
//!
//! ## Components
//!
//! - `JobStore`: persistence seam (`InMemoryJobStore`, `PostgresJobStore`)
//! - `JobQueue`: enqueue and operator actions
//! - `QueueEngine`: claims, dispatches to handlers, and records outcomes
//! - `HandlerRegistry`: maps a `JobType` to its handler

pub mod backoff;
pub mod engine;
pub mod handler;
pub mod policy;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use backoff::BackoffPolicy;
pub use engine::QueueEngine;
pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobHandler, TypedJobHandler};
pub use policy::{BalancedBatchPolicy, BatchOptions, PolicyOverrides, MAX_BATCH};
pub use postgres::PostgresJobStore;
pub use queue::{JobQueue, QueueError, MAX_LIST_LIMIT};
pub use store::{
    InMemoryJobStore, JobQuery, JobReset, JobStats, JobStore, JobStoreError, JobTransition,
    LatestFailure, ProcessingAggregate, QueueHealthCounts,
};
pub use types::{
    BatchResult, EnqueueOptions, EnqueueOutcome, Job, JobContext, JobId, JobStatus, JobType,
    ProcessFilter, ProcessOutcome, WorkerId,
};
