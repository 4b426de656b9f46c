//! Queue self-monitoring: health snapshots, alert rules, and notifications.

pub mod alert;
pub mod health_check;
pub mod notify;
pub mod postgres;
pub mod snapshot;
pub mod store;

pub use alert::{
    evaluate_rules, reconcile, should_notify, Alert, AlertCandidate, AlertId, AlertSeverity, AlertStatus,
    AlertType, Reconciled, BACKLOG_KEY, FAILURE_SPIKE_KEY, STALE_PROCESSING_KEY,
};
pub use health_check::{HealthCheckResult, HealthCheckService, OpsError, QueueHealthCheckHandler, ALERT_ACTION_URL};
pub use notify::{
    NotificationRequest, Notifier, NotifyError, QueueingNotifier, RecipientDirectory, RecordingNotifier,
    StaticRecipients,
};
pub use postgres::PostgresOpsStore;
pub use snapshot::{
    HealthSnapshotComputer, MetricKind, MetricSnapshot, ProcessingStats24h, QueueHealthSnapshot, SnapshotId,
};
pub use store::{AlertQuery, InMemoryOpsStore, OpsStore, OpsStoreError};
