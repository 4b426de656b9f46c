//! Alert model, rule evaluation, and the per-rule state machine.
//!
//! Everything here is pure: the health-check service loads the existing row,
//! calls [`reconcile`], and persists what comes back.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use caseflow_core::{DomainError, TenantId, UserId};

use super::snapshot::QueueHealthSnapshot;
use crate::config::AlertThresholds;

/// Alert identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Alert severity. Ordered by urgency: `P0 > P1 > P2 > P3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertSeverity {
    P0,
    P1,
    P2,
    P3,
}

impl AlertSeverity {
    fn urgency(self) -> u8 {
        match self {
            AlertSeverity::P0 => 3,
            AlertSeverity::P1 => 2,
            AlertSeverity::P2 => 1,
            AlertSeverity::P3 => 0,
        }
    }

    /// The more urgent of the two.
    pub fn escalate(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::P0 => "P0",
            AlertSeverity::P1 => "P1",
            AlertSeverity::P2 => "P2",
            AlertSeverity::P3 => "P3",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "P0" => Ok(AlertSeverity::P0),
            "P1" => Ok(AlertSeverity::P1),
            "P2" => Ok(AlertSeverity::P2),
            "P3" => Ok(AlertSeverity::P3),
            other => Err(DomainError::unknown_variant("alert severity", other)),
        }
    }
}

impl Ord for AlertSeverity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.urgency().cmp(&other.urgency())
    }
}

impl PartialOrd for AlertSeverity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    Acked,
    Snoozed,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "OPEN",
            AlertStatus::Acked => "ACKED",
            AlertStatus::Snoozed => "SNOOZED",
            AlertStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "OPEN" => Ok(AlertStatus::Open),
            "ACKED" => Ok(AlertStatus::Acked),
            "SNOOZED" => Ok(AlertStatus::Snoozed),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            other => Err(DomainError::unknown_variant("alert status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    QueueBacklog,
    QueueStaleProcessing,
    QueueFailureSpike,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::QueueBacklog => "QUEUE_BACKLOG",
            AlertType::QueueStaleProcessing => "QUEUE_STALE_PROCESSING",
            AlertType::QueueFailureSpike => "QUEUE_FAILURE_SPIKE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "QUEUE_BACKLOG" => Ok(AlertType::QueueBacklog),
            "QUEUE_STALE_PROCESSING" => Ok(AlertType::QueueStaleProcessing),
            "QUEUE_FAILURE_SPIKE" => Ok(AlertType::QueueFailureSpike),
            other => Err(DomainError::unknown_variant("alert type", other)),
        }
    }
}

pub const BACKLOG_KEY: &str = "queue/backlog";
pub const STALE_PROCESSING_KEY: &str = "queue/stale-processing";
pub const FAILURE_SPIKE_KEY: &str = "queue/failure-spike";

/// One alert row per `(tenant_id, idempotency_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub tenant_id: TenantId,
    pub idempotency_key: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    pub payload: JsonValue,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// A fresh `OPEN` alert from a triggered candidate.
    pub fn open(tenant_id: TenantId, candidate: &AlertCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: AlertId::new(),
            tenant_id,
            idempotency_key: candidate.idempotency_key.clone(),
            alert_type: candidate.alert_type,
            severity: candidate.severity,
            status: AlertStatus::Open,
            title: candidate.title.clone(),
            message: candidate.message.clone(),
            payload: candidate.payload.clone(),
            first_seen_at: now,
            last_seen_at: now,
            last_notified_at: None,
            snoozed_until: None,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_snooze_active(&self, now: DateTime<Utc>) -> bool {
        self.status == AlertStatus::Snoozed && self.snoozed_until.is_some_and(|until| until > now)
    }

    /// Whether a triggered run should reopen this alert.
    ///
    /// A `SNOOZED` row reopens only once its end time has passed; without one it stays snoozed.
    pub fn should_reopen(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            AlertStatus::Resolved => true,
            AlertStatus::Snoozed => self.snoozed_until.is_some_and(|until| until <= now),
            AlertStatus::Open | AlertStatus::Acked => false,
        }
    }

    pub fn acknowledge(&mut self, user: UserId, now: DateTime<Utc>) {
        self.status = AlertStatus::Acked;
        self.acknowledged_at = Some(now);
        self.acknowledged_by = Some(user);
        self.snoozed_until = None;
        self.updated_at = now;
    }

    /// Snoozing also counts as acknowledging.
    pub fn snooze(&mut self, user: UserId, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = AlertStatus::Snoozed;
        self.snoozed_until = Some(until);
        self.acknowledged_at = Some(now);
        self.acknowledged_by = Some(user);
        self.updated_at = now;
    }

    pub fn unsnooze(&mut self, now: DateTime<Utc>) {
        self.status = AlertStatus::Open;
        self.snoozed_until = None;
        self.updated_at = now;
    }

    pub fn resolve(&mut self, user: Option<UserId>, now: DateTime<Utc>) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolved_by = user;
        self.snoozed_until = None;
        self.updated_at = now;
    }
}

/// A rule's verdict for one health-check run.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub idempotency_key: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub payload: JsonValue,
    pub triggered: bool,
}

/// Evaluate the backlog, stale-processing and failure-spike rules.
pub fn evaluate_rules(
    snapshot: &QueueHealthSnapshot,
    thresholds: &AlertThresholds,
    lease_timeout: Duration,
) -> Vec<AlertCandidate> {
    let t = thresholds;
    let payload = json!({ "snapshot": snapshot, "thresholds": thresholds });
    let age = snapshot.oldest_due_pending_age_seconds;

    let backlog_triggered = snapshot.due_pending >= t.due_pending_threshold
        || age.is_some_and(|a| a >= t.oldest_age_seconds_threshold);
    let backlog_severity = if snapshot.due_pending >= t.due_pending_p0_threshold
        || age.is_some_and(|a| a >= t.oldest_age_seconds_p0_threshold)
    {
        AlertSeverity::P0
    } else {
        AlertSeverity::P1
    };

    let stale_triggered = snapshot.stale_processing >= t.stale_processing_threshold;
    let stale_severity = if snapshot.stale_processing >= t.stale_processing_threshold.max(5) {
        AlertSeverity::P0
    } else {
        AlertSeverity::P1
    };

    let failure_triggered = snapshot.failed_24h >= t.failed_24h_threshold;
    let spike_bar = t
        .failed_24h_threshold
        .saturating_mul(5)
        .max(t.failed_24h_threshold.saturating_add(50));
    let failure_severity = if snapshot.failed_24h >= spike_bar {
        AlertSeverity::P1
    } else {
        AlertSeverity::P2
    };

    let latest = snapshot
        .latest_failure
        .as_ref()
        .map(|f| format!(", latest failure={}", f.job_type))
        .unwrap_or_default();

    vec![
        AlertCandidate {
            idempotency_key: BACKLOG_KEY.to_string(),
            alert_type: AlertType::QueueBacklog,
            severity: backlog_severity,
            title: "Queue backlog".to_string(),
            message: format!(
                "due pending={}, oldest wait={}",
                snapshot.due_pending,
                format_age_seconds(age)
            ),
            payload: payload.clone(),
            triggered: backlog_triggered,
        },
        AlertCandidate {
            idempotency_key: STALE_PROCESSING_KEY.to_string(),
            alert_type: AlertType::QueueStaleProcessing,
            severity: stale_severity,
            title: "Queue processing looks stuck".to_string(),
            message: format!(
                "stale processing={} (lease timeout > {}m)",
                snapshot.stale_processing,
                lease_timeout.num_minutes()
            ),
            payload: payload.clone(),
            triggered: stale_triggered,
        },
        AlertCandidate {
            idempotency_key: FAILURE_SPIKE_KEY.to_string(),
            alert_type: AlertType::QueueFailureSpike,
            severity: failure_severity,
            title: "Queue failures rising".to_string(),
            message: format!("failed in 24h={}{latest}", snapshot.failed_24h),
            payload,
            triggered: failure_triggered,
        },
    ]
}

/// What a health-check run does to one rule's alert row.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Not triggered and nothing open.
    Unchanged,
    Resolved(Alert),
    Created(Alert),
    Updated { alert: Alert, reopened: bool },
}

/// Apply a candidate to the existing alert row (if any).
///
/// Severity only escalates while the rule stays triggered; an explicit
/// `ACKED` or active `SNOOZED` status is kept.
pub fn reconcile(
    existing: Option<&Alert>,
    candidate: &AlertCandidate,
    tenant_id: TenantId,
    now: DateTime<Utc>,
) -> Reconciled {
    if !candidate.triggered {
        return match existing {
            Some(alert) if alert.status != AlertStatus::Resolved => {
                let mut alert = alert.clone();
                alert.resolve(None, now);
                alert.last_seen_at = now;
                Reconciled::Resolved(alert)
            }
            _ => Reconciled::Unchanged,
        };
    }

    let Some(existing) = existing else {
        return Reconciled::Created(Alert::open(tenant_id, candidate, now));
    };

    let reopened = existing.should_reopen(now);
    let mut alert = existing.clone();
    alert.alert_type = candidate.alert_type;
    alert.severity = existing.severity.escalate(candidate.severity);
    alert.title = candidate.title.clone();
    alert.message = candidate.message.clone();
    alert.payload = candidate.payload.clone();
    alert.last_seen_at = now;
    alert.updated_at = now;

    if reopened {
        alert.status = AlertStatus::Open;
        alert.first_seen_at = now;
        alert.acknowledged_at = None;
        alert.acknowledged_by = None;
        alert.resolved_at = None;
        alert.resolved_by = None;
        alert.snoozed_until = None;
    }

    Reconciled::Updated { alert, reopened }
}

/// Throttled notification gate.
///
/// `fresh` is true when this run created or reopened the alert.
pub fn should_notify(alert: &Alert, fresh: bool, now: DateTime<Utc>, interval: Duration) -> bool {
    if alert.status != AlertStatus::Open || alert.is_snooze_active(now) {
        return false;
    }
    fresh || alert.last_notified_at.is_none_or(|last| now - last >= interval)
}

/// `42s`, `5m`, `1h30m`; `-` when absent.
pub fn format_age_seconds(seconds: Option<u64>) -> String {
    let Some(seconds) = seconds else {
        return "-".to_string();
    };
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m");
    }
    format!("{}h{}m", minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::snapshot::ProcessingStats24h;

    fn snapshot(tenant: TenantId, now: DateTime<Utc>) -> QueueHealthSnapshot {
        QueueHealthSnapshot {
            tenant_id: tenant,
            captured_at: now,
            due_pending: 0,
            scheduled_pending: 0,
            oldest_due_pending_at: None,
            oldest_due_pending_age_seconds: None,
            stale_processing: 0,
            failed_24h: 0,
            latest_failure: None,
            processing_24h: ProcessingStats24h::default(),
        }
    }

    fn candidates(snap: &QueueHealthSnapshot) -> Vec<AlertCandidate> {
        evaluate_rules(snap, &AlertThresholds::default(), Duration::minutes(10))
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(AlertSeverity::P0 > AlertSeverity::P1);
        assert!(AlertSeverity::P2 > AlertSeverity::P3);
        assert_eq!(AlertSeverity::P2.escalate(AlertSeverity::P0), AlertSeverity::P0);
        assert_eq!(AlertSeverity::P0.escalate(AlertSeverity::P3), AlertSeverity::P0);
    }

    #[test]
    fn quiet_snapshot_triggers_nothing() {
        let snap = snapshot(TenantId::new(), Utc::now());
        assert!(candidates(&snap).iter().all(|c| !c.triggered));
    }

    #[test]
    fn backlog_escalates_on_count_or_age() {
        let now = Utc::now();
        let mut snap = snapshot(TenantId::new(), now);
        snap.due_pending = 250;
        let backlog = &candidates(&snap)[0];
        assert_eq!(backlog.idempotency_key, BACKLOG_KEY);
        assert!(backlog.triggered);
        assert_eq!(backlog.severity, AlertSeverity::P1);

        snap.due_pending = 3;
        snap.oldest_due_pending_age_seconds = Some(3600);
        let backlog = &candidates(&snap)[0];
        assert!(backlog.triggered);
        assert_eq!(backlog.severity, AlertSeverity::P0);
        assert_eq!(backlog.message, "due pending=3, oldest wait=1h0m");
    }

    #[test]
    fn stale_and_failure_rules_use_their_bars() {
        let mut snap = snapshot(TenantId::new(), Utc::now());
        snap.stale_processing = 1;
        snap.failed_24h = 59;
        let c = candidates(&snap);
        assert_eq!((c[1].triggered, c[1].severity), (true, AlertSeverity::P1));
        assert_eq!(c[1].message, "stale processing=1 (lease timeout > 10m)");
        assert_eq!((c[2].triggered, c[2].severity), (true, AlertSeverity::P2));

        snap.stale_processing = 5;
        snap.failed_24h = 60;
        let c = candidates(&snap);
        assert_eq!(c[1].severity, AlertSeverity::P0);
        assert_eq!(c[2].severity, AlertSeverity::P1);
    }

    #[test]
    fn severity_never_downgrades_while_triggered() {
        let now = Utc::now();
        let tenant = TenantId::new();
        let mut snap = snapshot(tenant, now);
        snap.due_pending = 5000;
        let p0 = candidates(&snap).remove(0);
        let Reconciled::Created(alert) = reconcile(None, &p0, tenant, now) else {
            panic!("expected a new alert");
        };
        assert_eq!(alert.severity, AlertSeverity::P0);

        snap.due_pending = 300;
        let p1 = candidates(&snap).remove(0);
        let later = now + Duration::minutes(1);
        let Reconciled::Updated { alert, reopened } = reconcile(Some(&alert), &p1, tenant, later) else {
            panic!("expected an update");
        };
        assert!(!reopened);
        assert_eq!(alert.severity, AlertSeverity::P0);
        assert_eq!(alert.last_seen_at, later);
        assert_eq!(alert.first_seen_at, now);
    }

    #[test]
    fn acked_alert_stays_acked_but_resolved_reopens() {
        let now = Utc::now();
        let tenant = TenantId::new();
        let mut snap = snapshot(tenant, now);
        snap.failed_24h = 10;
        let c = candidates(&snap).remove(2);

        let mut alert = Alert::open(tenant, &c, now);
        alert.acknowledge(UserId::new(), now);
        let Reconciled::Updated { alert: acked, reopened } = reconcile(Some(&alert), &c, tenant, now) else {
            panic!("expected an update");
        };
        assert!(!reopened);
        assert_eq!(acked.status, AlertStatus::Acked);

        alert.resolve(Some(UserId::new()), now);
        let later = now + Duration::hours(2);
        let Reconciled::Updated { alert: back, reopened } = reconcile(Some(&alert), &c, tenant, later) else {
            panic!("expected an update");
        };
        assert!(reopened);
        assert_eq!(back.status, AlertStatus::Open);
        assert_eq!(back.first_seen_at, later);
        assert_eq!(back.acknowledged_by, None);
        assert_eq!(back.resolved_at, None);
    }

    #[test]
    fn snooze_holds_until_it_expires() {
        let now = Utc::now();
        let tenant = TenantId::new();
        let mut snap = snapshot(tenant, now);
        snap.stale_processing = 2;
        let c = candidates(&snap).remove(1);

        let mut alert = Alert::open(tenant, &c, now);
        alert.snooze(UserId::new(), now + Duration::minutes(30), now);

        let Reconciled::Updated { alert: during, reopened } =
            reconcile(Some(&alert), &c, tenant, now + Duration::minutes(10))
        else {
            panic!("expected an update");
        };
        assert!(!reopened);
        assert_eq!(during.status, AlertStatus::Snoozed);
        assert!(!should_notify(&during, reopened, now + Duration::minutes(10), Duration::minutes(60)));

        let Reconciled::Updated { alert: after, reopened } =
            reconcile(Some(&alert), &c, tenant, now + Duration::minutes(30))
        else {
            panic!("expected an update");
        };
        assert!(reopened);
        assert_eq!(after.status, AlertStatus::Open);
        assert_eq!(after.snoozed_until, None);
    }

    #[test]
    fn snooze_without_end_time_is_not_reopened() {
        let now = Utc::now();
        let tenant = TenantId::new();
        let mut snap = snapshot(tenant, now);
        snap.stale_processing = 2;
        let c = candidates(&snap).remove(1);

        let mut alert = Alert::open(tenant, &c, now);
        alert.status = AlertStatus::Snoozed;
        alert.snoozed_until = None;

        let later = now + Duration::hours(2);
        let Reconciled::Updated { alert: still, reopened } = reconcile(Some(&alert), &c, tenant, later) else {
            panic!("expected an update");
        };
        assert!(!reopened);
        assert_eq!(still.status, AlertStatus::Snoozed);
        assert_eq!(still.last_seen_at, later);
        assert!(!should_notify(&still, reopened, later, Duration::minutes(60)));
    }

    #[test]
    fn untriggered_rule_resolves_open_alert_once() {
        let now = Utc::now();
        let tenant = TenantId::new();
        let quiet = candidates(&snapshot(tenant, now)).remove(0);

        assert_eq!(reconcile(None, &quiet, tenant, now), Reconciled::Unchanged);

        let mut loud = quiet.clone();
        loud.triggered = true;
        let mut open = Alert::open(tenant, &loud, now);
        open.snooze(UserId::new(), now + Duration::hours(1), now);
        let Reconciled::Resolved(resolved) = reconcile(Some(&open), &quiet, tenant, now) else {
            panic!("expected resolution");
        };
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.resolved_by, None);
        assert_eq!(resolved.snoozed_until, None);

        assert_eq!(reconcile(Some(&resolved), &quiet, tenant, now), Reconciled::Unchanged);
    }

    #[test]
    fn notification_is_throttled_by_interval() {
        let now = Utc::now();
        let tenant = TenantId::new();
        let mut c = candidates(&snapshot(tenant, now)).remove(0);
        c.triggered = true;
        let mut alert = Alert::open(tenant, &c, now);
        let interval = Duration::minutes(60);

        assert!(should_notify(&alert, true, now, interval));
        alert.last_notified_at = Some(now);
        assert!(!should_notify(&alert, false, now + Duration::minutes(59), interval));
        assert!(should_notify(&alert, false, now + Duration::minutes(60), interval));
    }

    #[test]
    fn age_formatting() {
        assert_eq!(format_age_seconds(None), "-");
        assert_eq!(format_age_seconds(Some(42)), "42s");
        assert_eq!(format_age_seconds(Some(600)), "10m");
        assert_eq!(format_age_seconds(Some(5400)), "1h30m");
    }
}
