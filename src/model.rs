//! Service and check result data structures

use crate::errors::{MonitorError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned service identifier, immutable after creation
pub type ServiceId = i64;

/// Lower bound accepted for a service's background check cadence
pub const MIN_CHECK_INTERVAL_SECONDS: u32 = 10;

pub const DEFAULT_CHECK_INTERVAL_SECONDS: u32 = 60;

/// A registered monitored endpoint
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub url: String,
    pub check_interval_seconds: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Registration payload for `POST /services/`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewService {
    pub name: String,
    pub url: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u32,
}

fn default_check_interval() -> u32 {
    DEFAULT_CHECK_INTERVAL_SECONDS
}

impl NewService {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
        }
    }

    pub fn with_check_interval(mut self, seconds: u32) -> Self {
        self.check_interval_seconds = seconds;
        self
    }

    /// Reject registrations the store would refuse anyway
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MonitorError::Validation("name cannot be empty".to_string()));
        }

        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| MonitorError::Validation(format!("invalid url {}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MonitorError::Validation(format!(
                "url must be http or https, got {}",
                url.scheme()
            )));
        }

        if self.check_interval_seconds < MIN_CHECK_INTERVAL_SECONDS {
            return Err(MonitorError::Validation(format!(
                "check_interval_seconds must be at least {}",
                MIN_CHECK_INTERVAL_SECONDS
            )));
        }

        Ok(())
    }
}

/// Immutable outcome of one probe.
///
/// `status_code` and `response_time_ms` are both absent when no HTTP
/// exchange completed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub is_up: bool,
    pub response_time_ms: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl CheckResult {
    pub fn up(timestamp: DateTime<Utc>, status_code: u16, response_time_ms: f64) -> Self {
        Self {
            timestamp,
            status_code: Some(status_code),
            is_up: true,
            response_time_ms: Some(response_time_ms),
            error_message: None,
        }
    }

    /// The target answered, but with a status that counts as down
    pub fn down(timestamp: DateTime<Utc>, status_code: u16, response_time_ms: f64) -> Self {
        Self {
            timestamp,
            status_code: Some(status_code),
            is_up: false,
            response_time_ms: Some(response_time_ms),
            error_message: None,
        }
    }

    /// No HTTP exchange completed
    pub fn unreachable(timestamp: DateTime<Utc>, error_message: impl Into<String>) -> Self {
        Self {
            timestamp,
            status_code: None,
            is_up: false,
            response_time_ms: None,
            error_message: Some(error_message.into()),
        }
    }

    /// Down because nothing answered, as opposed to down with a status code.
    /// Aggregations fold both into `is_up == false`.
    pub fn is_transport_failure(&self) -> bool {
        !self.is_up && self.status_code.is_none()
    }
}

/// Payload of `GET /services/{id}/status`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProbeStatus {
    pub is_up: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ProbeStatus {
    /// Stamp the payload with its arrival time.
    ///
    /// The prober reports elapsed time even for connection failures; that
    /// number is dropped so a down-without-response never carries latency.
    pub fn into_check_result(self, timestamp: DateTime<Utc>) -> CheckResult {
        let response_time_ms = if !self.is_up && self.status_code.is_none() {
            None
        } else {
            self.response_time_ms
        };

        CheckResult {
            timestamp,
            status_code: self.status_code,
            is_up: self.is_up,
            response_time_ms,
            error_message: self.error_message,
        }
    }
}

/// Latest known status for a service
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ServiceStatus {
    /// No check result has ever been obtained
    #[default]
    Unknown,
    Known(CheckResult),
}

impl ServiceStatus {
    pub fn result(&self) -> Option<&CheckResult> {
        match self {
            ServiceStatus::Known(result) => Some(result),
            ServiceStatus::Unknown => None,
        }
    }

    pub fn is_up(&self) -> Option<bool> {
        self.result().map(|r| r.is_up)
    }
}

impl From<Option<CheckResult>> for ServiceStatus {
    fn from(result: Option<CheckResult>) -> Self {
        result.map_or(ServiceStatus::Unknown, ServiceStatus::Known)
    }
}

/// Put a store-provided history in oldest-first order.
///
/// The store may answer in either direction; only a sequence that is
/// clearly newest-first gets reversed.
pub fn normalize_oldest_first(mut results: Vec<CheckResult>) -> Vec<CheckResult> {
    if let (Some(first), Some(last)) = (results.first(), results.last()) {
        if first.timestamp > last.timestamp {
            results.reverse();
        }
    }
    results
}

/// Parse a store timestamp: RFC 3339, or a naive ISO-8601 datetime in UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    raw.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

mod timestamp_format {
    use super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }
}
