//! `caseflow-core`: shared primitives for the background queue and ops alerting.
//!
//! This crate holds **pure** building blocks (identifiers, error model); storage
//! and runtime concerns live in `caseflow-queue`.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{TenantId, UserId};
