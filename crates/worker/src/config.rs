//! Worker configuration, read from the environment

use std::time::Duration;

use storefront_durable::worker::PollerConfig;
use storefront_durable::{EngineConfig, OrchestratorConfig, WorkerPoolConfig};
use uuid::Uuid;

use crate::workflows::WorkflowSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub worker_id: String,
    pub max_concurrent_runs: usize,
    pub poll_min_interval: Duration,
    pub poll_max_interval: Duration,
    pub poll_batch_size: usize,
    pub stale_run_threshold: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_timeout: Duration,
    pub abandoned_cart_delay: Duration,
    pub low_stock_threshold: i64,
    /// Where notifications are POSTed; logged only when unset
    pub notify_webhook_url: Option<String>,
}

impl WorkerConfig {
    /// Read configuration from environment variables
    ///
    /// - `DATABASE_URL` (required)
    /// - `WORKER_ID` (default: `worker-<uuid>`)
    /// - `MAX_CONCURRENT_RUNS` (default: 10)
    /// - `POLL_MIN_INTERVAL_MS` / `POLL_MAX_INTERVAL_MS` (default: 100 / 5000)
    /// - `POLL_BATCH_SIZE` (default: 50)
    /// - `STALE_RUN_THRESHOLD_SECS` (default: 300)
    /// - `HEARTBEAT_INTERVAL_SECS` (default: 30, 0 disables)
    /// - `SHUTDOWN_TIMEOUT_SECS` (default: 30)
    /// - `ABANDONED_CART_DELAY_SECS` (default: 86400)
    /// - `LOW_STOCK_THRESHOLD` (default: 5)
    /// - `NOTIFY_WEBHOOK_URL`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let worker_id =
            var("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::now_v7()));

        Ok(Self {
            database_url,
            worker_id,
            max_concurrent_runs: parse(&var, "MAX_CONCURRENT_RUNS", 10)?,
            poll_min_interval: Duration::from_millis(parse(&var, "POLL_MIN_INTERVAL_MS", 100)?),
            poll_max_interval: Duration::from_millis(parse(&var, "POLL_MAX_INTERVAL_MS", 5_000)?),
            poll_batch_size: parse(&var, "POLL_BATCH_SIZE", 50)?,
            stale_run_threshold: Duration::from_secs(parse(&var, "STALE_RUN_THRESHOLD_SECS", 300)?),
            heartbeat_interval: Duration::from_secs(parse(&var, "HEARTBEAT_INTERVAL_SECS", 30)?),
            shutdown_timeout: Duration::from_secs(parse(&var, "SHUTDOWN_TIMEOUT_SECS", 30)?),
            abandoned_cart_delay: Duration::from_secs(parse(
                &var,
                "ABANDONED_CART_DELAY_SECS",
                86_400,
            )?),
            low_stock_threshold: parse(&var, "LOW_STOCK_THRESHOLD", 5)?,
            notify_webhook_url: var("NOTIFY_WEBHOOK_URL"),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let poller = PollerConfig::default()
            .with_min_interval(self.poll_min_interval)
            .with_max_interval(self.poll_max_interval.max(self.poll_min_interval));

        EngineConfig {
            orchestrator: OrchestratorConfig::default()
                .with_stale_threshold(self.stale_run_threshold)
                .with_batch_size(self.poll_batch_size)
                .with_heartbeat_interval(self.heartbeat_interval),
            pool: WorkerPoolConfig::default()
                .with_worker_id(self.worker_id.clone())
                .with_max_concurrency(self.max_concurrent_runs)
                .with_poller(poller)
                .with_shutdown_timeout(self.shutdown_timeout),
        }
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            abandoned_cart_delay: self.abandoned_cart_delay,
            low_stock_threshold: self.low_stock_threshold,
        }
    }
}

fn parse<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
