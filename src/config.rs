//! Per-process settings, read once at startup from the environment.
use std::time::Duration;

use crate::util::env::{env_opt, env_parse};

pub const DEFAULT_QUEUE_NAME: &str = "retailer_scanning_queue";

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self {
            max_connections: env_parse("DB_MAX_CONNS", 10u32),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout_secs: i32,
    pub poll: Duration,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            name: env_opt("SCAN_QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            visibility_timeout_secs: env_parse("SCAN_QUEUE_VT_SECS", 300i32).max(1),
            poll: Duration::from_millis(env_parse("SCAN_QUEUE_POLL_MS", 500u64).max(10)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub startup_delay: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(env_parse("SCHEDULE_INTERVAL_SECS", 3600u64).max(1)),
            startup_delay: Duration::from_secs(env_parse("STARTUP_DELAY_SECS", 10u64)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub scrape_timeout: Duration,
    /// Pause after a queue or store error before polling again.
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            concurrency: env_parse("WORKER_CONCURRENCY", 1usize).max(1),
            scrape_timeout: Duration::from_secs(env_parse("SCRAPE_TIMEOUT_SECS", 30u64).max(1)),
            error_backoff: Duration::from_secs(env_parse("WORKER_ERROR_BACKOFF_SECS", 5u64)),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            scrape_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub poll: Duration,
    /// Unreported batches older than this with outstanding searches are logged as stalled.
    pub stalled_after: Duration,
    pub subject: String,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
}

impl ReporterConfig {
    pub fn from_env() -> Self {
        Self {
            poll: Duration::from_secs(env_parse("REPORT_POLL_SECS", 10u64).max(1)),
            stalled_after: Duration::from_secs(env_parse("STALLED_BATCH_SECS", 21_600u64)),
            subject: env_opt("REPORT_SUBJECT").unwrap_or_else(|| "New vinyl just dropped".to_string()),
            webhook_url: env_opt("NOTIFY_WEBHOOK_URL"),
            webhook_token: env_opt("NOTIFY_WEBHOOK_TOKEN"),
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(10),
            stalled_after: Duration::from_secs(21_600),
            subject: "New vinyl just dropped".to_string(),
            webhook_url: None,
            webhook_token: None,
        }
    }
}
