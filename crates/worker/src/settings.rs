//! Worker process settings, read from the environment.

use std::time::Duration;

use anyhow::Context;

use caseflow_core::{TenantId, UserId};
use caseflow_queue::config::{AlertThresholds, QueueConfig};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub database_url: String,
    /// Tenants that get a periodic queue health check.
    pub tenant_ids: Vec<TenantId>,
    /// Who is told about queue alerts (every tenant).
    pub alert_recipients: Vec<UserId>,
    pub poll_interval: Duration,
    pub max_jobs: usize,
    pub time_budget: Duration,
    /// Run the bundled DDL before starting.
    pub apply_schema: bool,
    pub queue: QueueConfig,
    pub thresholds: AlertThresholds,
}

impl WorkerSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let tenant_ids = parse_list(&std::env::var("WORKER_TENANT_IDS").unwrap_or_default())
            .context("WORKER_TENANT_IDS must be comma-separated UUIDs")?;
        let alert_recipients = parse_list(&std::env::var("WORKER_ALERT_RECIPIENTS").unwrap_or_default())
            .context("WORKER_ALERT_RECIPIENTS must be comma-separated UUIDs")?;

        Ok(Self {
            database_url,
            tenant_ids,
            alert_recipients,
            poll_interval: Duration::from_millis(env_u64("WORKER_POLL_INTERVAL_MS", 1000)?.max(50)),
            max_jobs: usize::try_from(env_u64("WORKER_MAX_JOBS", 20)?).unwrap_or(usize::MAX),
            time_budget: Duration::from_millis(env_u64("WORKER_TIME_BUDGET_MS", 20_000)?),
            apply_schema: std::env::var("WORKER_APPLY_SCHEMA").is_ok_and(|v| matches!(v.trim(), "1" | "true")),
            queue: QueueConfig::from_env(),
            thresholds: AlertThresholds::from_env(),
        })
    }
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a non-negative integer, got {raw:?}")),
        _ => Ok(default),
    }
}

fn parse_list<T>(raw: &str) -> anyhow::Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().with_context(|| format!("invalid id {s:?}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_lists_and_skips_blanks() {
        let a = TenantId::new();
        let b = TenantId::new();
        let parsed: Vec<TenantId> = parse_list(&format!(" {a}, ,{b} ")).unwrap();
        assert_eq!(parsed, vec![a, b]);
        assert!(parse_list::<TenantId>("").unwrap().is_empty());
        assert!(parse_list::<UserId>("nope").is_err());
    }
}
