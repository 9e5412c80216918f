//! Configuration management for the service monitor

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the services REST API
    pub api_base_url: String,

    /// HTTP timeout for API requests
    pub http_timeout: Duration,

    /// Revalidation tick while a single service is observed in detail
    pub detail_refresh_interval: Duration,

    /// Revalidation tick for the overview of all services
    pub overview_refresh_interval: Duration,

    /// History window for the compact (sparkline) view
    pub compact_history_limit: usize,

    /// History window for the detail view
    pub detail_history_limit: usize,

    /// Initial ring size per service
    pub history_capacity: usize,

    /// Hard ceiling a requested window can grow a ring to
    pub max_history_capacity: usize,

    /// How often the daemon logs dashboard metrics
    pub metrics_report_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8002".to_string(),
            http_timeout: Duration::from_secs(10),
            detail_refresh_interval: Duration::from_secs(15),
            overview_refresh_interval: Duration::from_secs(30),
            compact_history_limit: 20,
            detail_history_limit: 60,
            history_capacity: 60,
            max_history_capacity: 500,
            metrics_report_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(url) = env::var("SERVICE_MONITOR_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(seconds) = env_parse::<u64>("HTTP_TIMEOUT_SECONDS") {
            config.http_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("DETAIL_REFRESH_SECONDS") {
            config.detail_refresh_interval = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("OVERVIEW_REFRESH_SECONDS") {
            config.overview_refresh_interval = Duration::from_secs(seconds);
        }

        if let Some(limit) = env_parse("COMPACT_HISTORY_LIMIT") {
            config.compact_history_limit = limit;
        }

        if let Some(limit) = env_parse("DETAIL_HISTORY_LIMIT") {
            config.detail_history_limit = limit;
        }

        if let Some(capacity) = env_parse("HISTORY_CAPACITY") {
            config.history_capacity = capacity;
        }

        if let Some(capacity) = env_parse("MAX_HISTORY_CAPACITY") {
            config.max_history_capacity = capacity;
        }

        if let Some(seconds) = env_parse::<u64>("METRICS_REPORT_SECONDS") {
            config.metrics_report_interval = Duration::from_secs(seconds);
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.api_base_url.is_empty() {
            return Err("api_base_url cannot be empty".to_string());
        }

        if self.http_timeout.is_zero() {
            return Err("http_timeout must be greater than 0".to_string());
        }

        if self.detail_refresh_interval.is_zero() || self.overview_refresh_interval.is_zero() {
            return Err("refresh intervals must be greater than 0".to_string());
        }

        if self.compact_history_limit == 0 || self.detail_history_limit == 0 {
            return Err("history limits must be greater than 0".to_string());
        }

        if self.history_capacity == 0 {
            return Err("history_capacity must be greater than 0".to_string());
        }

        if self.history_capacity > self.max_history_capacity {
            return Err("history_capacity cannot exceed max_history_capacity".to_string());
        }

        if self.metrics_report_interval.is_zero() {
            return Err("metrics_report_interval must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
