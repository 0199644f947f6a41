//! Environment-driven wiring for stores, scheduling, and delivery.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | unset: in-memory stores |
//! | `REDIS_URL` | unset: in-memory queue |
//! | `CHRONICLE_DB_MAX_CONNECTIONS` | `10` |
//! | `CHRONICLE_RETRY_MAX_ATTEMPTS` | `5` |
//! | `CHRONICLE_RETRY_BASE_DELAY_MS` | `1000` |
//! | `CHRONICLE_RETRY_MAX_DELAY_MS` | `300000` |
//! | `CHRONICLE_PRECONDITION_MAX_WAIT_SECS` | unset: wait forever |
//! | `CHRONICLE_WORKER_BATCH_SIZE` | `16` |
//! | `CHRONICLE_WORKER_RECEIVE_WAIT_MS` | `1000` |
//! | `CHRONICLE_SWEEP_INTERVAL_SECS` | `30`, `0` disables |
//! | `CHRONICLE_HANDLING_WINDOW_SECS` | `30` |
//! | `CHRONICLE_MAX_DELIVERIES` | `10` |
//! | `CHRONICLE_STREAM_KEY` | `chronicle:scheduled-commands` |
//! | `CHRONICLE_CONSUMER_GROUP` | `chronicle.delivery` |

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::delivery::WorkerConfig;
use crate::scheduling::{RetryPolicy, SchedulingPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub db_max_connections: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub precondition_max_wait: Option<Duration>,
    pub batch_size: usize,
    pub receive_wait: Duration,
    pub sweep_interval: Option<Duration>,
    pub handling_window: Duration,
    pub max_deliveries: u32,
    pub stream_key: String,
    pub consumer_group: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let worker = WorkerConfig::default();
        Self {
            database_url: None,
            redis_url: None,
            db_max_connections: 10,
            retry_max_attempts: retry.max_attempts,
            retry_base_delay: retry.base_delay,
            retry_max_delay: retry.max_delay,
            precondition_max_wait: None,
            batch_size: worker.batch_size,
            receive_wait: worker.receive_wait,
            sweep_interval: worker.sweep_interval,
            handling_window: Duration::from_secs(30),
            max_deliveries: 10,
            stream_key: "chronicle:scheduled-commands".to_string(),
            consumer_group: "chronicle.delivery".to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        config.database_url = get("DATABASE_URL");
        config.redis_url = get("REDIS_URL");

        if let Some(n) = parse(&get, "CHRONICLE_DB_MAX_CONNECTIONS")? {
            config.db_max_connections = n;
        }
        if let Some(n) = parse::<u32>(&get, "CHRONICLE_RETRY_MAX_ATTEMPTS")? {
            anyhow::ensure!(n >= 1, "CHRONICLE_RETRY_MAX_ATTEMPTS must be at least 1");
            config.retry_max_attempts = n;
        }
        if let Some(ms) = parse(&get, "CHRONICLE_RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&get, "CHRONICLE_RETRY_MAX_DELAY_MS")? {
            config.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&get, "CHRONICLE_PRECONDITION_MAX_WAIT_SECS")? {
            config.precondition_max_wait = Some(Duration::from_secs(secs));
        }
        if let Some(n) = parse::<usize>(&get, "CHRONICLE_WORKER_BATCH_SIZE")? {
            anyhow::ensure!(n >= 1, "CHRONICLE_WORKER_BATCH_SIZE must be at least 1");
            config.batch_size = n;
        }
        if let Some(ms) = parse(&get, "CHRONICLE_WORKER_RECEIVE_WAIT_MS")? {
            config.receive_wait = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&get, "CHRONICLE_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse(&get, "CHRONICLE_HANDLING_WINDOW_SECS")? {
            config.handling_window = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&get, "CHRONICLE_MAX_DELIVERIES")? {
            config.max_deliveries = n;
        }
        if let Some(key) = get("CHRONICLE_STREAM_KEY") {
            config.stream_key = key;
        }
        if let Some(group) = get("CHRONICLE_CONSUMER_GROUP") {
            config.consumer_group = group;
        }

        Ok(config)
    }

    pub fn use_persistent_stores(&self) -> bool {
        self.database_url.is_some()
    }

    pub fn scheduling_policy(&self) -> SchedulingPolicy {
        let retry = RetryPolicy::exponential(
            self.retry_max_attempts,
            self.retry_base_delay,
            self.retry_max_delay,
        );
        let policy = SchedulingPolicy::default().with_retry(retry);
        match self.precondition_max_wait {
            Some(wait) => policy.with_precondition_max_wait(wait),
            None => policy,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            receive_wait: self.receive_wait,
            sweep_interval: self.sweep_interval,
            ..WorkerConfig::default()
        }
    }

    #[cfg(feature = "redis")]
    pub fn redis_settings(&self) -> crate::delivery::RedisStreamsSettings {
        crate::delivery::RedisStreamsSettings {
            dlq_key: format!("{}:dlq", self.stream_key),
            delayed_key: format!("{}:delayed", self.stream_key),
            stream_key: self.stream_key.clone(),
            group: self.consumer_group.clone(),
            max_deliveries: self.max_deliveries,
            ..crate::delivery::RedisStreamsSettings::default()
        }
    }

    /// Connect to `DATABASE_URL` and create the tables if needed.
    pub async fn connect_postgres(&self) -> Result<PgPool> {
        let url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to use persistent stores")?;
        let pool = PgPoolOptions::new()
            .max_connections(self.db_max_connections)
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        crate::schema::migrate(&pool)
            .await
            .context("failed to apply the chronicle schema")?;
        info!(max_connections = self.db_max_connections, "postgres stores ready");
        Ok(pool)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))
        })
        .transpose()
}
