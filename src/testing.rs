//! Scripted in-memory `ServiceApi` for unit tests

use crate::api::ServiceApi;
use crate::errors::{MonitorError, Result};
use crate::model::{CheckResult, NewService, ProbeStatus, Service, ServiceId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum StubProbe {
    Status(ProbeStatus),
    NoChecks,
    Unreachable(String),
    NotFound,
}

impl StubProbe {
    pub(crate) fn up(ms: f64) -> Self {
        StubProbe::Status(ProbeStatus {
            is_up: true,
            status_code: Some(200),
            response_time_ms: Some(ms),
            error_message: None,
        })
    }

    pub(crate) fn http_down(code: u16, ms: f64) -> Self {
        StubProbe::Status(ProbeStatus {
            is_up: false,
            status_code: Some(code),
            response_time_ms: Some(ms),
            error_message: None,
        })
    }
}

#[derive(Debug, Default)]
struct StubState {
    services: HashMap<ServiceId, Service>,
    probes: HashMap<ServiceId, StubProbe>,
    histories: HashMap<ServiceId, Vec<CheckResult>>,
    probe_counts: HashMap<ServiceId, usize>,
    next_id: ServiceId,
}

/// Probes take `delay` (tokio time, so paused clocks apply)
#[derive(Debug, Default)]
pub(crate) struct StubApi {
    state: Mutex<StubState>,
    delay: Duration,
}

impl StubApi {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            state: Mutex::new(StubState {
                next_id: 100,
                ..StubState::default()
            }),
            delay,
        }
    }

    pub(crate) fn with_service(self, id: ServiceId, probe: StubProbe) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.services.insert(
                id,
                Service {
                    id,
                    name: format!("service-{}", id),
                    url: format!("https://service-{}.example.com", id),
                    check_interval_seconds: 60,
                    is_active: true,
                },
            );
            state.probes.insert(id, probe);
        }
        self
    }

    pub(crate) fn with_history(self, id: ServiceId, results: Vec<CheckResult>) -> Self {
        self.state.lock().unwrap().histories.insert(id, results);
        self
    }

    /// The store records a new check; `/status` then reports it
    pub(crate) fn record_check(&self, id: ServiceId, result: CheckResult) {
        let mut state = self.state.lock().unwrap();
        state.probes.insert(
            id,
            StubProbe::Status(ProbeStatus {
                is_up: result.is_up,
                status_code: result.status_code,
                response_time_ms: result.response_time_ms,
                error_message: result.error_message.clone(),
            }),
        );
        state.histories.entry(id).or_default().push(result);
    }

    pub(crate) fn set_probe(&self, id: ServiceId, probe: StubProbe) {
        self.state.lock().unwrap().probes.insert(id, probe);
    }

    pub(crate) fn probe_count(&self, id: ServiceId) -> usize {
        self.state
            .lock()
            .unwrap()
            .probe_counts
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ServiceApi for StubApi {
    async fn list_services(&self) -> Result<Vec<Service>> {
        let mut services: Vec<Service> =
            self.state.lock().unwrap().services.values().cloned().collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    async fn get_service(&self, id: ServiceId) -> Result<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&id)
            .cloned()
            .ok_or(MonitorError::NotFound(id))
    }

    async fn create_service(&self, service: &NewService) -> Result<Service> {
        service.validate()?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let created = Service {
            id: state.next_id,
            name: service.name.clone(),
            url: service.url.clone(),
            check_interval_seconds: service.check_interval_seconds,
            is_active: true,
        };
        state.services.insert(created.id, created.clone());
        state.probes.insert(created.id, StubProbe::NoChecks);
        Ok(created)
    }

    async fn delete_service(&self, id: ServiceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.histories.remove(&id);
        state.probes.insert(id, StubProbe::NotFound);
        state
            .services
            .remove(&id)
            .map(|_| ())
            .ok_or(MonitorError::NotFound(id))
    }

    async fn probe_status(&self, id: ServiceId) -> Result<Option<ProbeStatus>> {
        let probe = {
            let mut state = self.state.lock().unwrap();
            *state.probe_counts.entry(id).or_default() += 1;
            state.probes.get(&id).cloned().unwrap_or(StubProbe::NotFound)
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match probe {
            StubProbe::Status(status) => Ok(Some(status)),
            StubProbe::NoChecks => Ok(None),
            StubProbe::Unreachable(msg) => Err(MonitorError::Transport(msg)),
            StubProbe::NotFound => Err(MonitorError::NotFound(id)),
        }
    }

    async fn history(&self, id: ServiceId, limit: usize) -> Result<Vec<CheckResult>> {
        let state = self.state.lock().unwrap();
        if !state.services.contains_key(&id) {
            return Err(MonitorError::NotFound(id));
        }
        let results = state.histories.get(&id).cloned().unwrap_or_default();
        let skip = results.len().saturating_sub(limit);
        Ok(results.into_iter().skip(skip).collect())
    }
}
