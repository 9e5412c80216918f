//! Polling coordinator: on-demand requests and interval revalidation

use crate::api::ServiceApi;
use crate::cache::{Begin, StatusCache, StatusReading};
use crate::errors::{ProbeError, ProbeResult};
use crate::history::HistoryBuffer;
use crate::model::{ServiceId, ServiceStatus};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What every caller joined onto one probe observes
pub type ProbeOutcome = ProbeResult<ServiceStatus>;

type SharedProbe = Shared<BoxFuture<'static, ProbeOutcome>>;

/// Result of a fire-and-forget refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Started,
    /// A request for this id was already in flight
    Skipped,
    /// The service has been deleted
    Removed,
}

struct LeaseEntry {
    holders: HashMap<Uuid, Duration>,
    period: Duration,
    ticker: JoinHandle<()>,
}

struct Inner {
    api: Arc<dyn ServiceApi>,
    cache: Arc<StatusCache>,
    history: Arc<HistoryBuffer>,
    in_flight: Mutex<HashMap<ServiceId, SharedProbe>>,
    leases: Mutex<HashMap<ServiceId, LeaseEntry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Join the in-flight probe for `id` or start one. The bool is true
    /// when this call started it.
    fn start(self: &Arc<Self>, id: ServiceId) -> ProbeResult<(SharedProbe, bool)> {
        let mut in_flight = lock(&self.in_flight);
        // a probe started before deletion may still be running
        if self.cache.is_removed(id) {
            return Err(ProbeError::NotFound(id));
        }
        if let Some(probe) = in_flight.get(&id) {
            return Ok((probe.clone(), false));
        }

        if self.cache.begin(id) == Begin::Removed {
            return Err(ProbeError::NotFound(id));
        }

        let inner = Arc::clone(self);
        let probe = async move { inner.probe(id).await }.boxed().shared();
        in_flight.insert(id, probe.clone());
        drop(in_flight);

        // runs to completion even if every caller stops waiting
        tokio::spawn(probe.clone());
        Ok((probe, true))
    }

    fn trigger(self: &Arc<Self>, id: ServiceId) -> Trigger {
        match self.start(id) {
            Ok((_, true)) => Trigger::Started,
            Ok((_, false)) => Trigger::Skipped,
            Err(_) => Trigger::Removed,
        }
    }

    async fn probe(self: Arc<Self>, id: ServiceId) -> ProbeOutcome {
        debug!("Probing service {}", id);

        let outcome = match self.api.probe_status(id).await {
            Ok(Some(status)) => Ok(ServiceStatus::Known(status.into_check_result(Utc::now()))),
            Ok(None) => Ok(ServiceStatus::Unknown),
            Err(e) => Err(ProbeError::from(e)),
        };

        // /status repeats the newest stored check, so a store-backed window
        // is reloaded rather than appended to
        let store_window = self.history.store_window(id);
        if let (Ok(_), Some(limit)) = (&outcome, store_window) {
            self.reload_history(id, limit).await;
        }

        self.complete(id, &outcome, store_window.is_none());
        outcome
    }

    async fn reload_history(&self, id: ServiceId, limit: usize) {
        match self.api.history(id, limit).await {
            Ok(stored) => self.history.seed(id, stored),
            Err(e) => warn!("Could not reload history for service {}: {}", id, e),
        }
    }

    fn complete(&self, id: ServiceId, outcome: &ProbeOutcome, append_live: bool) {
        let mut in_flight = lock(&self.in_flight);

        match outcome {
            Ok(status) => {
                if self.cache.settle(id, status.clone()) {
                    if let Some(result) = status.result().filter(|_| append_live) {
                        self.history.append(id, result.clone());
                    }
                } else {
                    debug!("Discarded probe result for untracked service {}", id);
                }
            }
            Err(reason) => {
                warn!("Probe for service {} failed: {}", id, reason);
                self.cache.fail(id, reason.clone());
                if reason.is_not_found() {
                    self.forget(id);
                }
            }
        }

        in_flight.remove(&id);
    }

    fn forget(&self, id: ServiceId) {
        self.cache.forget(id);
        self.history.forget(id);

        if let Some(entry) = lock(&self.leases).remove(&id) {
            entry.ticker.abort();
            info!(
                "Stopped revalidation for service {} ({} leases dropped)",
                id,
                entry.holders.len()
            );
        }
    }

    fn acquire(self: &Arc<Self>, id: ServiceId, period: Duration) -> Option<Uuid> {
        if self.cache.is_removed(id) {
            return None;
        }

        let lease_id = Uuid::new_v4();
        let mut leases = lock(&self.leases);

        match leases.get_mut(&id) {
            Some(entry) => {
                entry.holders.insert(lease_id, period);
                if period < entry.period {
                    entry.ticker.abort();
                    entry.ticker = respawn_ticker(Arc::downgrade(self), id, period);
                    entry.period = period;
                }
                debug!(
                    "Lease {} joined service {} ({} holders, every {:?})",
                    lease_id,
                    id,
                    entry.holders.len(),
                    entry.period
                );
            }
            None => {
                leases.insert(
                    id,
                    LeaseEntry {
                        holders: HashMap::from([(lease_id, period)]),
                        period,
                        ticker: spawn_ticker(Arc::downgrade(self), id, period),
                    },
                );
                info!("Started revalidation for service {} every {:?}", id, period);
            }
        }

        Some(lease_id)
    }

    fn release(self: &Arc<Self>, id: ServiceId, lease_id: Uuid) {
        let mut leases = lock(&self.leases);
        let Some(entry) = leases.get_mut(&id) else {
            return;
        };
        if entry.holders.remove(&lease_id).is_none() {
            return;
        }
        let remaining = entry.holders.values().min().copied();

        let Some(period) = remaining else {
            if let Some(entry) = leases.remove(&id) {
                entry.ticker.abort();
            }
            info!("Stopped revalidation for service {}, no observers left", id);
            return;
        };

        // the fastest remaining observer sets the pace
        if let Some(entry) = leases.get_mut(&id) {
            if period > entry.period && tokio::runtime::Handle::try_current().is_ok() {
                entry.ticker.abort();
                entry.ticker = respawn_ticker(Arc::downgrade(self), id, period);
                entry.period = period;
            }
        }
    }
}

/// Ticker whose first revalidation fires immediately
fn spawn_ticker(weak: Weak<Inner>, id: ServiceId, period: Duration) -> JoinHandle<()> {
    run_ticker(weak, id, interval(period))
}

/// Replacement ticker for a service already being revalidated; waits a full
/// period before its first tick
fn respawn_ticker(weak: Weak<Inner>, id: ServiceId, period: Duration) -> JoinHandle<()> {
    run_ticker(weak, id, interval_at(Instant::now() + period, period))
}

fn run_ticker(weak: Weak<Inner>, id: ServiceId, mut ticker: Interval) -> JoinHandle<()> {
    tokio::spawn(async move {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let Some(inner) = weak.upgrade() else {
                break;
            };
            match inner.trigger(id) {
                Trigger::Started => debug!("Revalidating service {}", id),
                Trigger::Skipped => debug!("Skipped tick for service {}, request in flight", id),
                Trigger::Removed => break,
            }
        }
    })
}

/// Drives probes for many services, each independently.
///
/// At most one probe per service id is in flight; callers that arrive while
/// one runs join it and get the same outcome.
#[derive(Clone)]
pub struct PollingCoordinator {
    inner: Arc<Inner>,
}

impl PollingCoordinator {
    pub fn new(
        api: Arc<dyn ServiceApi>,
        cache: Arc<StatusCache>,
        history: Arc<HistoryBuffer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                history,
                in_flight: Mutex::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.inner.cache
    }

    pub fn history(&self) -> &Arc<HistoryBuffer> {
        &self.inner.history
    }

    /// Refresh `id` and wait for the outcome
    #[instrument(skip(self))]
    pub async fn request(&self, id: ServiceId) -> ProbeOutcome {
        let (probe, _) = self.inner.start(id)?;
        probe.await
    }

    /// Refresh `id` without waiting
    pub fn trigger(&self, id: ServiceId) -> Trigger {
        self.inner.trigger(id)
    }

    /// Refresh several services concurrently; one failure does not affect the rest
    pub async fn request_many(&self, ids: &[ServiceId]) -> Vec<(ServiceId, ProbeOutcome)> {
        join_all(ids.iter().map(|&id| async move { (id, self.request(id).await) })).await
    }

    /// Observe `id`, revalidating every `period` until the lease is dropped.
    ///
    /// Leases on the same id share one ticker running at the shortest
    /// requested period.
    pub fn watch(&self, id: ServiceId, period: Duration) -> Lease {
        let updates = self.inner.cache.subscribe(id);
        let lease_id = self.inner.acquire(id, period);

        Lease {
            service_id: id,
            lease_id,
            inner: Arc::downgrade(&self.inner),
            updates,
        }
    }

    /// Stop tracking a deleted service
    pub fn forget(&self, id: ServiceId) {
        self.inner.forget(id);
    }

    pub fn is_in_flight(&self, id: ServiceId) -> bool {
        lock(&self.inner.in_flight).contains_key(&id)
    }

    pub fn lease_count(&self, id: ServiceId) -> usize {
        lock(&self.inner.leases)
            .get(&id)
            .map_or(0, |entry| entry.holders.len())
    }

    pub fn revalidation_period(&self, id: ServiceId) -> Option<Duration> {
        lock(&self.inner.leases).get(&id).map(|entry| entry.period)
    }

    pub fn stats(&self) -> PollerStats {
        let in_flight = lock(&self.inner.in_flight).len();
        let leases = lock(&self.inner.leases);
        PollerStats {
            watched: leases.len(),
            leases: leases.values().map(|entry| entry.holders.len()).sum(),
            in_flight,
        }
    }

    /// Stop every ticker; in-flight probes still land in the cache
    pub fn shutdown(&self) {
        let mut leases = lock(&self.inner.leases);
        for (_, entry) in leases.drain() {
            entry.ticker.abort();
        }
        info!("Polling coordinator stopped");
    }
}

/// Coordinator statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PollerStats {
    pub watched: usize,
    pub leases: usize,
    pub in_flight: usize,
}

/// A consumer's interest in one service. Dropping it releases the ticker.
pub struct Lease {
    service_id: ServiceId,
    lease_id: Option<Uuid>,
    inner: Weak<Inner>,
    updates: watch::Receiver<StatusReading>,
}

impl Lease {
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// False when the service was already deleted at acquisition
    pub fn is_active(&self) -> bool {
        self.lease_id.is_some()
    }

    pub fn current(&self) -> StatusReading {
        self.updates.borrow().clone()
    }

    /// Wait for the next transition; None once the service is forgotten
    pub async fn changed(&mut self) -> Option<StatusReading> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let (Some(lease_id), Some(inner)) = (self.lease_id, self.inner.upgrade()) {
            inner.release(self.service_id, lease_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::summarize;
    use crate::model::CheckResult;
    use crate::testing::{StubApi, StubProbe};
    use chrono::{DateTime, TimeZone};
    use tokio::time::sleep;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn single(
        delay: Duration,
        id: ServiceId,
        probe: StubProbe,
    ) -> (PollingCoordinator, Arc<StubApi>) {
        coordinator(StubApi::new(delay).with_service(id, probe))
    }

    fn coordinator(api: StubApi) -> (PollingCoordinator, Arc<StubApi>) {
        let api = Arc::new(api);
        let coordinator = PollingCoordinator::new(
            api.clone(),
            Arc::new(StatusCache::new()),
            Arc::new(HistoryBuffer::new(60, 500)),
        );
        (coordinator, api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_probe() {
        let (poller, api) = single(Duration::from_millis(100), 1, StubProbe::up(40.0));

        let (first, second) = tokio::join!(poller.request(1), poller.request(1));

        assert!(first.is_ok());
        assert_eq!(first, second);
        assert_eq!(api.probe_count(1), 1);
        assert_eq!(poller.history().read(1, 60).unwrap().len(), 1);
        assert!(!poller.is_in_flight(1));
    }

    #[tokio::test]
    async fn test_request_settles_and_appends_history() {
        let (poller, api) = single(Duration::ZERO, 1, StubProbe::up(25.0));

        let status = poller.request(1).await.unwrap();
        assert_eq!(status.is_up(), Some(true));
        assert_eq!(poller.cache().get(1), StatusReading::Ready(status));

        poller.request(1).await.unwrap();
        assert_eq!(api.probe_count(1), 2);
        assert_eq!(poller.history().read(1, 60).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_http_error_status_is_a_settled_result() {
        let (poller, _) = single(Duration::ZERO, 2, StubProbe::http_down(503, 8.0));

        let status = poller.request(2).await.unwrap();
        let result = status.result().unwrap();
        assert!(!result.is_up);
        assert_eq!(result.status_code, Some(503));
        assert!(poller.cache().get(2).settled().is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_last_good() {
        let (poller, api) = single(Duration::ZERO, 1, StubProbe::up(70.0));
        poller.request(1).await.unwrap();

        api.set_probe(1, StubProbe::Unreachable("connection refused".to_string()));
        let outcome = poller.request(1).await;
        assert!(matches!(outcome, Err(ProbeError::Transport(_))));

        let view = poller.cache().view(1);
        assert!(matches!(view.reading, StatusReading::Error(_)));
        assert!(view.is_stale());
        assert_eq!(view.last_known.unwrap().response_time_ms, Some(70.0));
        assert_eq!(poller.history().read(1, 60).unwrap().len(), 1);

        api.set_probe(1, StubProbe::up(65.0));
        poller.request(1).await.unwrap();
        assert!(poller.cache().get(1).settled().is_some());
    }

    #[tokio::test]
    async fn test_never_checked_service_settles_unknown() {
        let (poller, _) = single(Duration::ZERO, 4, StubProbe::NoChecks);

        assert_eq!(poller.request(4).await, Ok(ServiceStatus::Unknown));
        assert_eq!(poller.cache().get(4), StatusReading::Ready(ServiceStatus::Unknown));
        assert!(poller.history().read(4, 20).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_is_visible_as_loading() {
        let (poller, api) = single(Duration::from_secs(1), 1, StubProbe::up(10.0));

        assert_eq!(poller.trigger(1), Trigger::Started);
        assert_eq!(poller.cache().get(1), StatusReading::Loading);
        assert_eq!(poller.trigger(1), Trigger::Skipped);

        poller.request(1).await.unwrap();
        assert_eq!(api.probe_count(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_revalidates_until_released() {
        let (poller, api) = single(Duration::from_millis(10), 1, StubProbe::up(10.0));

        let lease = poller.watch(1, Duration::from_secs(15));
        assert!(lease.is_active());
        sleep(Duration::from_secs(31)).await;
        assert_eq!(api.probe_count(1), 3);

        drop(lease);
        assert_eq!(poller.lease_count(1), 0);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(api.probe_count(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_skipped_while_in_flight() {
        let (poller, api) = single(Duration::from_secs(20), 1, StubProbe::up(10.0));

        let _lease = poller.watch(1, Duration::from_secs(15));
        sleep(Duration::from_secs(31)).await;

        // t=0 starts, t=15 skipped, t=30 starts
        assert_eq!(api.probe_count(1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_stops_ticks_and_forgets() {
        let (poller, api) = coordinator(StubApi::new(Duration::from_millis(10)));

        let mut lease = poller.watch(9, Duration::from_secs(15));
        sleep(Duration::from_secs(61)).await;

        assert_eq!(api.probe_count(9), 1);
        assert_eq!(poller.lease_count(9), 0);
        assert_eq!(poller.cache().get(9), StatusReading::Error(ProbeError::NotFound(9)));
        assert_eq!(poller.history().read(9, 20), Err(ProbeError::NotFound(9)));

        assert_eq!(poller.request(9).await, Err(ProbeError::NotFound(9)));
        assert_eq!(api.probe_count(9), 1);

        assert_eq!(lease.current(), StatusReading::Error(ProbeError::NotFound(9)));
        while lease.changed().await.is_some() {}
    }

    #[tokio::test]
    async fn test_leases_are_reference_counted() {
        let (poller, _) = single(Duration::ZERO, 1, StubProbe::up(10.0));

        let slow = poller.watch(1, Duration::from_secs(30));
        let fast = poller.watch(1, Duration::from_secs(15));
        assert_eq!(poller.lease_count(1), 2);
        assert_eq!(poller.revalidation_period(1), Some(Duration::from_secs(15)));

        drop(fast);
        assert_eq!(poller.lease_count(1), 1);
        assert_eq!(poller.revalidation_period(1), Some(Duration::from_secs(30)));

        drop(slow);
        assert_eq!(poller.revalidation_period(1), None);
        assert_eq!(poller.stats().watched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_observes_transitions() {
        let (poller, _) = single(Duration::from_millis(10), 1, StubProbe::up(10.0));

        let mut lease = poller.watch(1, Duration::from_secs(15));
        assert_eq!(lease.changed().await, Some(StatusReading::Loading));

        let settled = lease.changed().await.unwrap();
        assert_eq!(settled.settled().unwrap().response_time_ms, Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_lease_mid_flight_is_harmless() {
        let (poller, _) = single(Duration::from_secs(1), 1, StubProbe::up(10.0));

        let lease = poller.watch(1, Duration::from_secs(15));
        sleep(Duration::from_millis(1)).await;
        assert!(poller.is_in_flight(1));

        drop(lease);
        sleep(Duration::from_secs(2)).await;

        assert!(!poller.is_in_flight(1));
        assert!(poller.cache().get(1).settled().is_some());
        assert_eq!(poller.stats().watched, 0);
    }

    #[tokio::test]
    async fn test_failures_are_independent_per_service() {
        let (poller, _) = coordinator(
            StubApi::new(Duration::ZERO)
                .with_service(1, StubProbe::up(10.0))
                .with_service(2, StubProbe::Unreachable("timeout".to_string())),
        );

        let outcomes = poller.request_many(&[1, 2]).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert!(poller.cache().get(1).settled().is_some());
        assert!(matches!(poller.cache().get(2), StatusReading::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_after_forget_does_not_join_earlier_probe() {
        let (poller, api) = single(Duration::from_secs(1), 1, StubProbe::up(10.0));

        assert_eq!(poller.trigger(1), Trigger::Started);
        tokio::task::yield_now().await;
        poller.forget(1);

        assert_eq!(poller.request(1).await, Err(ProbeError::NotFound(1)));
        assert_eq!(poller.trigger(1), Trigger::Removed);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(api.probe_count(1), 1);
        assert_eq!(poller.cache().get(1), StatusReading::Error(ProbeError::NotFound(1)));
        assert_eq!(poller.history().read(1, 60), Err(ProbeError::NotFound(1)));
    }

    #[tokio::test]
    async fn test_store_backed_history_is_reloaded_not_appended() {
        let stored = vec![CheckResult::up(at(0), 200, 100.0), CheckResult::up(at(60), 200, 50.0)];
        let (poller, api) = coordinator(
            StubApi::new(Duration::ZERO)
                .with_service(1, StubProbe::up(50.0))
                .with_history(1, stored.clone()),
        );
        poller.history().seed(1, stored);

        for _ in 0..4 {
            poller.request(1).await.unwrap();
        }
        let window = poller.history().read(1, 60).unwrap();
        let latencies: Vec<_> = window.iter().map(|r| r.response_time_ms).collect();
        assert_eq!(latencies, vec![Some(100.0), Some(50.0)]);
        assert_eq!(summarize(&window).avg_latency_ms, Some(75));

        api.record_check(1, CheckResult::up(at(120), 200, 80.0));
        poller.request(1).await.unwrap();
        let window = poller.history().read(1, 60).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[2].timestamp, at(120));
        assert_eq!(api.probe_count(1), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faster_lease_does_not_revalidate_immediately() {
        let (poller, api) = single(Duration::from_millis(10), 1, StubProbe::up(10.0));

        let _slow = poller.watch(1, Duration::from_secs(30));
        sleep(Duration::from_secs(5)).await;
        assert_eq!(api.probe_count(1), 1);

        let _fast = poller.watch(1, Duration::from_secs(15));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(api.probe_count(1), 1);

        // replacement ticker first fires at t=20
        sleep(Duration::from_secs(15)).await;
        assert_eq!(api.probe_count(1), 2);
    }
}
