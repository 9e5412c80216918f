//! Service monitor: the read surface a dashboard is built on

use crate::api::{ApiMetricsSnapshot, HttpServiceApi, MeteredApi, ServiceApi};
use crate::cache::{StatusCache, StatusReading, StatusView};
use crate::config::Config;
use crate::errors::{MonitorError, ProbeResult, Result};
use crate::history::HistoryBuffer;
use crate::metrics::{DashboardMetrics, HistorySummary, aggregate, summarize};
use crate::model::{CheckResult, NewService, Service, ServiceId};
use crate::poller::{Lease, PollingCoordinator, ProbeOutcome};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

/// Owns the status cache, history buffer and polling coordinator for the
/// currently displayed set of services.
pub struct ServiceMonitor {
    config: Config,
    api: Arc<dyn ServiceApi>,
    metered: Option<Arc<MeteredApi<HttpServiceApi>>>,
    poller: PollingCoordinator,
}

impl ServiceMonitor {
    /// Monitor backed by an arbitrary API implementation
    pub fn new(config: Config, api: Arc<dyn ServiceApi>) -> Self {
        let cache = Arc::new(StatusCache::new());
        let history = Arc::new(HistoryBuffer::new(
            config.history_capacity,
            config.max_history_capacity,
        ));
        let poller = PollingCoordinator::new(Arc::clone(&api), cache, history);

        Self {
            config,
            api,
            metered: None,
            poller,
        }
    }

    /// Monitor talking to the REST API named in `config`, with call metrics
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate().map_err(MonitorError::Config)?;

        let http = HttpServiceApi::new(config.api_base_url.clone(), config.http_timeout)?;
        let metered = Arc::new(MeteredApi::new(http));
        let api: Arc<dyn ServiceApi> = metered.clone();

        let mut monitor = Self::new(config, api);
        monitor.metered = Some(metered);
        Ok(monitor)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn poller(&self) -> &PollingCoordinator {
        &self.poller
    }

    pub async fn services(&self) -> Result<Vec<Service>> {
        self.api.list_services().await
    }

    pub async fn service(&self, id: ServiceId) -> Result<Service> {
        self.api.get_service(id).await.inspect_err(|e| self.forget_if_gone(id, e))
    }

    pub async fn register(&self, service: NewService) -> Result<Service> {
        let created = self.api.create_service(&service).await?;
        info!("Registered service {} ({})", created.id, created.url);
        Ok(created)
    }

    /// Delete a service; once acknowledged its status and history report NotFound
    #[instrument(skip(self))]
    pub async fn remove(&self, id: ServiceId) -> Result<()> {
        match self.api.delete_service(id).await {
            Ok(()) | Err(MonitorError::NotFound(_)) => {
                self.poller.forget(id);
                info!("Removed service {}", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn forget_if_gone(&self, id: ServiceId, err: &MonitorError) {
        if matches!(err, MonitorError::NotFound(_)) {
            self.poller.forget(id);
        }
    }

    /// Current status: a concrete status, Loading, or Error
    pub fn status(&self, id: ServiceId) -> StatusReading {
        self.poller.cache().get(id)
    }

    /// Current status plus the last good result for stale display
    pub fn status_view(&self, id: ServiceId) -> StatusView {
        self.poller.cache().view(id)
    }

    /// Most recent `limit` results held in memory, oldest first
    pub fn history(&self, id: ServiceId, limit: usize) -> ProbeResult<Vec<CheckResult>> {
        self.poller.history().read(id, limit)
    }

    /// Fetch `limit` results from the store, seed the buffer with them and
    /// return the merged window
    #[instrument(skip(self))]
    pub async fn load_history(&self, id: ServiceId, limit: usize) -> Result<Vec<CheckResult>> {
        let stored = self
            .api
            .history(id, limit)
            .await
            .inspect_err(|e| self.forget_if_gone(id, e))?;

        debug!("Loaded {} stored results for service {}", stored.len(), id);
        self.poller.history().seed(id, stored);
        Ok(self.poller.history().read(id, limit)?)
    }

    pub fn history_summary(&self, id: ServiceId, limit: usize) -> ProbeResult<HistorySummary> {
        self.history(id, limit).map(|window| summarize(&window))
    }

    /// KPIs over the given ids as currently cached
    pub fn metrics(&self, ids: &[ServiceId]) -> DashboardMetrics {
        aggregate(self.poller.cache().snapshot(ids).values())
    }

    /// KPIs over every service the cache currently tracks
    pub fn metrics_all(&self) -> DashboardMetrics {
        aggregate(self.poller.cache().snapshot_all().values())
    }

    pub async fn request(&self, id: ServiceId) -> ProbeOutcome {
        self.poller.request(id).await
    }

    pub async fn refresh_all(&self, ids: &[ServiceId]) -> Vec<(ServiceId, ProbeOutcome)> {
        self.poller.request_many(ids).await
    }

    /// Revalidate at the detail-view cadence while the lease is held
    pub fn watch_detail(&self, id: ServiceId) -> Lease {
        self.poller.watch(id, self.config.detail_refresh_interval)
    }

    /// Revalidate at the overview cadence while the lease is held
    pub fn watch_overview(&self, id: ServiceId) -> Lease {
        self.poller.watch(id, self.config.overview_refresh_interval)
    }

    pub async fn api_metrics(&self) -> Option<ApiMetricsSnapshot> {
        match &self.metered {
            Some(metered) => Some(metered.metrics().await),
            None => None,
        }
    }

    /// Watch `ids` (all listed services when empty) and log KPIs until Ctrl-C
    #[instrument(skip(self))]
    pub async fn start(&self, ids: Vec<ServiceId>, detail: bool) -> Result<()> {
        let ids = if ids.is_empty() {
            self.services().await?.into_iter().map(|s| s.id).collect()
        } else {
            ids
        };
        info!("Monitoring {} services", ids.len());

        let limit = if detail {
            self.config.detail_history_limit
        } else {
            self.config.compact_history_limit
        };

        for &id in &ids {
            if let Err(e) = self.load_history(id, limit).await {
                warn!("Could not load history for service {}: {}", id, e);
            }
        }

        let leases: Vec<Lease> = ids
            .iter()
            .map(|&id| {
                if detail {
                    self.watch_detail(id)
                } else {
                    self.watch_overview(id)
                }
            })
            .collect();

        let mut report = interval(self.config.metrics_report_interval);
        loop {
            tokio::select! {
                _ = report.tick() => self.report(&ids, limit).await,
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(|e| {
                        MonitorError::Other(format!("Failed to wait for shutdown signal: {}", e))
                    })?;
                    break;
                }
            }
        }

        info!("Shutting down service monitor");
        drop(leases);
        self.shutdown();
        Ok(())
    }

    async fn report(&self, ids: &[ServiceId], limit: usize) {
        let metrics = self.metrics(ids);
        info!(
            up = metrics.up_count,
            down = metrics.down_count,
            avg_latency_ms = ?metrics.avg_latency_ms,
            uptime_percent = ?metrics.uptime_percent,
            "Dashboard metrics"
        );

        for &id in ids {
            if let Ok(summary) = self.history_summary(id, limit) {
                debug!(
                    service = id,
                    samples = summary.samples,
                    uptime_percent = ?summary.uptime_percent,
                    avg_latency_ms = ?summary.avg_latency_ms,
                    "History window"
                );
            }
        }

        if let Some(api) = self.api_metrics().await {
            info!(
                "API metrics - {:.1}% success rate, {} attempts, avg {}ms",
                api.success_rate, api.attempts, api.avg_duration_ms
            );
        }

        let stats = self.poller.stats();
        let history = self.poller.history().stats();
        debug!(
            "Watching {} services ({} leases, {} in flight), {} history entries",
            stats.watched, stats.leases, stats.in_flight, history.entries
        );
    }

    pub fn shutdown(&self) {
        self.poller.shutdown();
    }
}
