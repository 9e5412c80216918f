//! HTTP client for the services REST API

use crate::errors::{MonitorError, Result};
use crate::model::{
    CheckResult, NewService, ProbeStatus, Service, ServiceId, normalize_oldest_first,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// The durable store and prober, as seen from the monitor.
///
/// `probe_status` answers `Ok(None)` when the service exists but has never
/// been checked.
#[async_trait]
pub trait ServiceApi: Send + Sync {
    async fn list_services(&self) -> Result<Vec<Service>>;

    async fn get_service(&self, id: ServiceId) -> Result<Service>;

    async fn create_service(&self, service: &NewService) -> Result<Service>;

    async fn delete_service(&self, id: ServiceId) -> Result<()>;

    async fn probe_status(&self, id: ServiceId) -> Result<Option<ProbeStatus>>;

    /// Up to `limit` most recent results, oldest first
    async fn history(&self, id: ServiceId, limit: usize) -> Result<Vec<CheckResult>>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// REST implementation backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpServiceApi {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpServiceApi {
    pub fn new(base_url: impl Into<String>, http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("service_monitor/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(MonitorError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: http_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        timeout(self.timeout, request.send())
            .await
            .map_err(|_| MonitorError::Transport("Request timeout".to_string()))?
            .map_err(MonitorError::Http)
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let body = response.text().await.map_err(MonitorError::Http)?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Map a non-success response onto an error; 404 means the id is gone
    async fn error_for(&self, response: Response, id: Option<ServiceId>) -> MonitorError {
        let status = response.status();
        let message = error_detail(response).await;

        match (status, id) {
            (StatusCode::NOT_FOUND, Some(id)) => MonitorError::NotFound(id),
            _ => MonitorError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }
}

async fn error_detail(response: Response) -> String {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.detail)
        .unwrap_or(body)
}

fn is_no_checks_detail(detail: &str) -> bool {
    detail.to_lowercase().contains("no checks")
}

#[async_trait]
impl ServiceApi for HttpServiceApi {
    async fn list_services(&self) -> Result<Vec<Service>> {
        let response = self.send(self.client.get(self.url("/services/"))).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, None).await);
        }
        self.json(response).await
    }

    async fn get_service(&self, id: ServiceId) -> Result<Service> {
        let url = self.url(&format!("/services/{}", id));
        let response = self.send(self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, Some(id)).await);
        }
        self.json(response).await
    }

    async fn create_service(&self, service: &NewService) -> Result<Service> {
        service.validate()?;

        let request = self.client.post(self.url("/services/")).json(service);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, None).await);
        }

        let created: Service = self.json(response).await?;
        debug!("Registered service {} ({})", created.id, created.name);
        Ok(created)
    }

    async fn delete_service(&self, id: ServiceId) -> Result<()> {
        let url = self.url(&format!("/services/{}", id));
        let response = self.send(self.client.delete(url)).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, Some(id)).await);
        }
        debug!("Deleted service {}", id);
        Ok(())
    }

    async fn probe_status(&self, id: ServiceId) -> Result<Option<ProbeStatus>> {
        let url = self.url(&format!("/services/{}/status", id));
        let response = self.send(self.client.get(url)).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            let detail = error_detail(response).await;
            if is_no_checks_detail(&detail) {
                return Ok(None);
            }
            return Err(MonitorError::NotFound(id));
        }

        if !status.is_success() {
            return Err(self.error_for(response, Some(id)).await);
        }

        self.json(response).await.map(Some)
    }

    async fn history(&self, id: ServiceId, limit: usize) -> Result<Vec<CheckResult>> {
        let url = self.url(&format!("/services/{}/history", id));
        let request = self.client.get(url).query(&[("limit", limit)]);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, Some(id)).await);
        }

        let mut results = normalize_oldest_first(self.json(response).await?);
        if results.len() > limit {
            results.drain(..results.len() - limit);
        }
        Ok(results)
    }
}

/// Any `ServiceApi` with request accounting
#[derive(Debug)]
pub struct MeteredApi<A> {
    inner: A,
    counters: Mutex<ApiCounters>,
}

#[derive(Debug, Default)]
struct ApiCounters {
    attempts: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
}

impl ApiCounters {
    fn record(&mut self, ok: bool, duration: Duration) {
        self.attempts += 1;
        if ok {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |m| m.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |m| m.max(duration)));
    }
}

impl<A: ServiceApi> MeteredApi<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            counters: Mutex::new(ApiCounters::default()),
        }
    }

    async fn track<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let start = Instant::now();
        let result = fut.await;
        let duration = start.elapsed();

        if let Err(e) = &result {
            warn!("API call {} failed after {}ms: {}", op, duration.as_millis(), e);
        }
        self.counters.lock().await.record(result.is_ok(), duration);
        result
    }

    pub async fn metrics(&self) -> ApiMetricsSnapshot {
        let counters = self.counters.lock().await;

        let success_rate = if counters.attempts > 0 {
            (counters.successes as f64 / counters.attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = mean_duration(counters.total_duration, counters.attempts);

        ApiMetricsSnapshot {
            attempts: counters.attempts,
            successes: counters.successes,
            failures: counters.failures,
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
            min_duration_ms: counters.min_duration.map(|d| d.as_millis() as u64),
            max_duration_ms: counters.max_duration.map(|d| d.as_millis() as u64),
        }
    }

    pub async fn reset_metrics(&self) {
        *self.counters.lock().await = ApiCounters::default();
    }
}

#[async_trait]
impl<A: ServiceApi> ServiceApi for MeteredApi<A> {
    async fn list_services(&self) -> Result<Vec<Service>> {
        self.track("list_services", self.inner.list_services()).await
    }

    async fn get_service(&self, id: ServiceId) -> Result<Service> {
        self.track("get_service", self.inner.get_service(id)).await
    }

    async fn create_service(&self, service: &NewService) -> Result<Service> {
        self.track("create_service", self.inner.create_service(service)).await
    }

    async fn delete_service(&self, id: ServiceId) -> Result<()> {
        self.track("delete_service", self.inner.delete_service(id)).await
    }

    async fn probe_status(&self, id: ServiceId) -> Result<Option<ProbeStatus>> {
        self.track("probe_status", self.inner.probe_status(id)).await
    }

    async fn history(&self, id: ServiceId, limit: usize) -> Result<Vec<CheckResult>> {
        self.track("history", self.inner.history(id, limit)).await
    }
}

/// Snapshot of API call metrics
#[derive(Debug, Clone)]
pub struct ApiMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

fn mean_duration(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
