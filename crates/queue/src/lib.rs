//! Background task queue and health-driven ops alerting.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped rows in one shared relational store
//! - Workers claim with a single atomic "skip locked" statement; no app-level mutex
//! - Completion/failure writes are conditional on the worker still holding the lease
//! - Exponential backoff with jitter until `max_attempts`, then `FAILED`
//! - Balanced batches reserve per-category sub-budgets so one burst cannot starve the rest
//! - A periodic health-check job snapshots queue metrics and drives an alert state machine
//!
//! ## Components
//!
//! - [`jobs::JobQueue`]: enqueue (idempotent) and operator job actions
//! - [`jobs::QueueEngine`]: `process_next`, `process_batch`, `process_balanced_batch`
//! - [`jobs::JobStore`]: persistence (in-memory or Postgres)
//! - [`ops::HealthCheckService`]: snapshot, alert evaluation, throttled notification

pub mod clock;
pub mod config;
pub mod jobs;
pub mod ops;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AlertThresholds, QueueConfig};
