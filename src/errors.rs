//! Error types for the service monitor

use crate::model::ServiceId;
use std::fmt;

pub type Result<T> = std::result::Result<T, MonitorError>;

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

#[derive(Debug)]
pub enum MonitorError {
    /// HTTP request failed before a response arrived
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Rejected input (e.g. a service registration)
    Validation(String),

    /// Service id deleted or never existed
    NotFound(ServiceId),

    /// The API answered with a non-success status
    Api { status: u16, message: String },

    /// Transport error
    Transport(String),

    /// Generic error with message
    Other(String),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Http(err) => write!(f, "HTTP error: {}", err),
            MonitorError::Json(err) => write!(f, "JSON error: {}", err),
            MonitorError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MonitorError::Validation(msg) => write!(f, "Invalid input: {}", msg),
            MonitorError::NotFound(id) => write!(f, "Service {} not found", id),
            MonitorError::Api { status, message } => {
                write!(f, "API error {}: {}", status, message)
            }
            MonitorError::Transport(msg) => write!(f, "Transport error: {}", msg),
            MonitorError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Http(err) => Some(err),
            MonitorError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        MonitorError::Http(err)
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::Json(err)
    }
}

/// Why a probe for one service produced no result.
///
/// Cloneable so that every caller joined onto the same in-flight probe
/// observes the same failure, and so the cache can keep it as state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// No response obtained: timeout, DNS, connection refused, API failure
    Transport(String),

    /// The service was deleted or never existed
    NotFound(ServiceId),
}

impl ProbeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProbeError::NotFound(_))
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Transport(msg) => write!(f, "probe failed: {}", msg),
            ProbeError::NotFound(id) => write!(f, "service {} not found", id),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<MonitorError> for ProbeError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::NotFound(id) => ProbeError::NotFound(id),
            other => ProbeError::Transport(other.to_string()),
        }
    }
}

impl From<ProbeError> for MonitorError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::NotFound(id) => MonitorError::NotFound(id),
            ProbeError::Transport(msg) => MonitorError::Transport(msg),
        }
    }
}
