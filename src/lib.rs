//! Service Monitor Library
//!
//! This library tracks liveness and latency of registered HTTP services: a
//! per-service status cache, bounded check history, interval revalidation
//! and the dashboard metrics derived from them.

pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod history;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod poller;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{HttpServiceApi, MeteredApi, ServiceApi};
pub use cache::{ProbeState, StatusCache, StatusReading, StatusView};
pub use config::Config;
pub use errors::{MonitorError, ProbeError, ProbeResult, Result};
pub use history::HistoryBuffer;
pub use metrics::{DashboardMetrics, HistorySummary};
pub use model::{CheckResult, NewService, ProbeStatus, Service, ServiceId, ServiceStatus};
pub use monitor::ServiceMonitor;
pub use poller::{Lease, PollingCoordinator, ProbeOutcome, Trigger};
