//! Engine configuration, read from the environment with sane defaults.

use std::path::PathBuf;
use std::time::Duration;

use jobfeed_storage::HttpBrowserConfig;

use crate::manager::ManagerConfig;
use crate::queue::TaskQueueConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub audit_log: PathBuf,
    pub sources_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_delay_secs: u64,
    pub chunk_delay_secs: u64,
    pub max_concurrent: usize,
    pub queue_poll_interval_ms: u64,
    pub queue_retention_secs: u64,
    pub queue_max_attempts: u32,
    pub extract_cron: String,
    pub stale_cron: String,
    pub stale_days: i64,
    pub web_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            audit_log: PathBuf::from("./data/audit.jsonl"),
            sources_file: None,
            user_agent: "jobfeed-bot/0.1".to_string(),
            http_timeout_secs: 20,
            source_delay_secs: 5,
            chunk_delay_secs: 20,
            max_concurrent: 2,
            queue_poll_interval_ms: 1_000,
            queue_retention_secs: 3_600,
            queue_max_attempts: 3,
            extract_cron: "0 0 6 * * *".to_string(),
            stale_cron: "0 30 6 * * *".to_string(),
            stale_days: 30,
            web_port: 8000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            audit_log: std::env::var("JOBFEED_AUDIT_LOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.audit_log),
            sources_file: std::env::var("JOBFEED_SOURCES_FILE").ok().map(PathBuf::from),
            user_agent: std::env::var("JOBFEED_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("JOBFEED_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            source_delay_secs: env_parse("JOBFEED_SOURCE_DELAY_SECS", defaults.source_delay_secs),
            chunk_delay_secs: env_parse("JOBFEED_CHUNK_DELAY_SECS", defaults.chunk_delay_secs),
            max_concurrent: env_parse("JOBFEED_MAX_CONCURRENT", defaults.max_concurrent),
            queue_poll_interval_ms: env_parse("JOBFEED_QUEUE_POLL_MS", defaults.queue_poll_interval_ms),
            queue_retention_secs: env_parse("JOBFEED_QUEUE_RETENTION_SECS", defaults.queue_retention_secs),
            queue_max_attempts: env_parse("JOBFEED_QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts),
            extract_cron: std::env::var("JOBFEED_EXTRACT_CRON").unwrap_or(defaults.extract_cron),
            stale_cron: std::env::var("JOBFEED_STALE_CRON").unwrap_or(defaults.stale_cron),
            stale_days: env_parse("JOBFEED_STALE_DAYS", defaults.stale_days),
            web_port: env_parse("JOBFEED_WEB_PORT", defaults.web_port),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            source_delay: Duration::from_secs(self.source_delay_secs),
            chunk_delay: Duration::from_secs(self.chunk_delay_secs),
        }
    }

    pub fn queue_config(&self) -> TaskQueueConfig {
        TaskQueueConfig {
            poll_interval: Duration::from_millis(self.queue_poll_interval_ms),
            retention: Duration::from_secs(self.queue_retention_secs),
            default_max_attempts: self.queue_max_attempts,
        }
    }

    pub fn browser_config(&self) -> HttpBrowserConfig {
        HttpBrowserConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}
