//! Environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use shadowstay_adapters::{CrawlerConfig, SelectorCatalog};
use shadowstay_storage::{BackoffPolicy, HttpClientConfig, RateLimitConfig, DEFAULT_USER_AGENT};

use crate::jobs::BatchPolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub registry_url: Option<String>,
    pub registry_file: PathBuf,
    pub selectors_path: Option<PathBuf>,
    pub targets_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub crawl_concurrency: usize,
    pub crawl_rate_limit: u32,
    pub crawl_rate_window_secs: u64,
    pub crawl_nav_attempts: u32,
    pub batch_error_threshold: u32,
    pub batch_backoff_base_ms: u64,
    pub batch_backoff_max_ms: u64,
    pub stale_after_days: i64,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub metrics_cron: String,
    pub cleanup_cron: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            database_url: text("DATABASE_URL"),
            registry_url: text("REGISTRY_URL"),
            registry_file: text("REGISTRY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./registry.json")),
            selectors_path: text("SHADOWSTAY_SELECTORS").map(PathBuf::from),
            targets_path: text("SHADOWSTAY_TARGETS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./targets.yaml")),
            user_agent: text("SHADOWSTAY_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("SHADOWSTAY_HTTP_TIMEOUT_SECS").unwrap_or(30),
            crawl_concurrency: number("CRAWL_CONCURRENCY").map(|v| v as usize).unwrap_or(2),
            crawl_rate_limit: number("CRAWL_RATE_LIMIT").map(|v| v as u32).unwrap_or(20),
            crawl_rate_window_secs: number("CRAWL_RATE_WINDOW_SECS").unwrap_or(60),
            crawl_nav_attempts: number("CRAWL_NAV_ATTEMPTS").map(|v| v as u32).unwrap_or(3),
            batch_error_threshold: number("BATCH_ERROR_THRESHOLD").map(|v| v as u32).unwrap_or(5),
            batch_backoff_base_ms: number("BATCH_BACKOFF_BASE_MS").unwrap_or(2_000),
            batch_backoff_max_ms: number("BATCH_BACKOFF_MAX_MS").unwrap_or(60_000),
            stale_after_days: number("STALE_AFTER_DAYS").map(|v| v as i64).unwrap_or(14),
            artifacts_dir: text("ARTIFACTS_DIR").map(PathBuf::from),
            reports_dir: text("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            scheduler_enabled: text("SHADOWSTAY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            metrics_cron: text("METRICS_CRON").unwrap_or_else(|| "0 0 3 * * Mon".to_string()),
            cleanup_cron: text("CLEANUP_CRON").unwrap_or_else(|| "0 30 2 * * *".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.crawl_rate_limit,
            window: Duration::from_secs(self.crawl_rate_window_secs),
        }
    }

    pub fn crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig {
            concurrency: self.crawl_concurrency.max(1),
            nav_attempts: self.crawl_nav_attempts.max(1),
            results_timeout: Duration::from_secs(self.http_timeout_secs.min(30)),
            ..Default::default()
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            error_threshold: self.batch_error_threshold.max(1),
            backoff: BackoffPolicy {
                max_retries: self.batch_error_threshold as usize,
                base_delay: Duration::from_millis(self.batch_backoff_base_ms),
                max_delay: Duration::from_millis(self.batch_backoff_max_ms),
            },
        }
    }

    pub fn selector_catalog(&self) -> anyhow::Result<SelectorCatalog> {
        SelectorCatalog::load_or_builtin(self.selectors_path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_without_environment() {
        let config = AppConfig::from_lookup(|_| None);
        assert!(config.database_url.is_none());
        assert_eq!(config.registry_file, PathBuf::from("./registry.json"));
        assert_eq!(config.crawl_concurrency, 2);
        assert_eq!(config.rate_limit_config().max_requests, 20);
        assert_eq!(config.batch_policy().error_threshold, 5);
        assert_eq!(config.stale_after_days, 14);
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://u:p@localhost/db"),
            ("CRAWL_CONCURRENCY", "4"),
            ("BATCH_ERROR_THRESHOLD", "not-a-number"),
            ("BATCH_BACKOFF_BASE_MS", "500"),
            ("SHADOWSTAY_SCHEDULER_ENABLED", "true"),
        ]);
        let config = AppConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://u:p@localhost/db"));
        assert_eq!(config.crawler_config().concurrency, 4);
        assert_eq!(config.batch_error_threshold, 5);
        assert_eq!(config.batch_policy().backoff.base_delay, Duration::from_millis(500));
        assert!(config.scheduler_enabled);
    }
}
