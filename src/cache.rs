//! Latest known status per service

use crate::errors::ProbeError;
use crate::model::{CheckResult, ServiceId, ServiceStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

/// Per-service refresh state. One variant per id, so a service can never
/// be loading and failed at once.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ProbeState {
    /// Never requested
    #[default]
    Idle,
    /// A probe is in flight; `previous` is kept for optimistic display
    Loading { previous: Option<CheckResult> },
    Settled(ServiceStatus),
    Failed {
        reason: ProbeError,
        last_good: Option<CheckResult>,
    },
}

impl ProbeState {
    /// Most recent good result regardless of the current phase
    pub fn last_known(&self) -> Option<&CheckResult> {
        match self {
            ProbeState::Idle => None,
            ProbeState::Loading { previous } => previous.as_ref(),
            ProbeState::Settled(status) => status.result(),
            ProbeState::Failed { last_good, .. } => last_good.as_ref(),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ProbeState::Loading { .. })
    }

    pub fn reading(&self) -> StatusReading {
        match self {
            ProbeState::Idle => StatusReading::Ready(ServiceStatus::Unknown),
            ProbeState::Loading { .. } => StatusReading::Loading,
            ProbeState::Settled(status) => StatusReading::Ready(status.clone()),
            ProbeState::Failed { reason, .. } => StatusReading::Error(reason.clone()),
        }
    }
}

/// What `get` reports for a service: exactly one of these at any time
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReading {
    Ready(ServiceStatus),
    Loading,
    Error(ProbeError),
}

impl StatusReading {
    /// The concrete result, if this reading is settled on one
    pub fn settled(&self) -> Option<&CheckResult> {
        match self {
            StatusReading::Ready(status) => status.result(),
            _ => None,
        }
    }
}

/// A reading plus the last good result, for stale-while-revalidate display
#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub reading: StatusReading,
    pub last_known: Option<CheckResult>,
}

impl StatusView {
    /// `last_known` is being shown in place of a current result
    pub fn is_stale(&self) -> bool {
        !matches!(self.reading, StatusReading::Ready(_)) && self.last_known.is_some()
    }
}

/// Outcome of trying to start a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    Started,
    AlreadyLoading,
    Removed,
}

#[derive(Debug)]
struct CacheEntry {
    state: ProbeState,
    tx: watch::Sender<StatusReading>,
}

impl CacheEntry {
    fn new() -> Self {
        let state = ProbeState::Idle;
        let (tx, _) = watch::channel(state.reading());
        Self { state, tx }
    }

    fn transition(&mut self, id: ServiceId, state: ProbeState) {
        debug!("Service {} status {:?} -> {:?}", id, self.state, state);
        self.state = state;
        self.tx.send_replace(self.state.reading());
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<ServiceId, CacheEntry>,
    removed: HashSet<ServiceId>,
}

/// Shared-read status cache partitioned by service id.
///
/// Reads never wait on a probe; they report `Loading` instead. The caller
/// that wins `begin` is the only writer for that id until it settles or
/// fails the entry.
#[derive(Debug, Default)]
pub struct StatusCache {
    state: RwLock<CacheState>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ServiceId) -> StatusReading {
        self.state(id).reading()
    }

    pub fn state(&self, id: ServiceId) -> ProbeState {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.removed.contains(&id) {
            return removed_state(id);
        }
        state
            .entries
            .get(&id)
            .map(|entry| entry.state.clone())
            .unwrap_or_default()
    }

    pub fn view(&self, id: ServiceId) -> StatusView {
        let state = self.state(id);
        StatusView {
            reading: state.reading(),
            last_known: state.last_known().cloned(),
        }
    }

    /// Move `id` to Loading unless a refresh is already running or the
    /// service is gone.
    pub fn begin(&self, id: ServiceId) -> Begin {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.removed.contains(&id) {
            return Begin::Removed;
        }

        let entry = state.entries.entry(id).or_insert_with(CacheEntry::new);
        if entry.state.is_loading() {
            return Begin::AlreadyLoading;
        }

        let previous = entry.state.last_known().cloned();
        entry.transition(id, ProbeState::Loading { previous });
        Begin::Started
    }

    /// Land a probe result. Ignored unless the entry is Loading.
    pub fn settle(&self, id: ServiceId, status: ServiceStatus) -> bool {
        self.finish(id, |_| ProbeState::Settled(status))
    }

    /// Record a failed probe, keeping the last good result for display.
    /// Ignored unless the entry is Loading.
    pub fn fail(&self, id: ServiceId, reason: ProbeError) -> bool {
        self.finish(id, |previous| ProbeState::Failed {
            reason,
            last_good: previous,
        })
    }

    fn finish(
        &self,
        id: ServiceId,
        next: impl FnOnce(Option<CheckResult>) -> ProbeState,
    ) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.removed.contains(&id) {
            return false;
        }

        match state.entries.get_mut(&id) {
            Some(entry) => match &mut entry.state {
                ProbeState::Loading { previous } => {
                    let previous = previous.take();
                    entry.transition(id, next(previous));
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Invalidate a deleted service; every later read reports NotFound
    pub fn forget(&self, id: ServiceId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.removed.insert(id);
        if let Some(mut entry) = state.entries.remove(&id) {
            entry.transition(id, removed_state(id));
        }
    }

    pub fn is_removed(&self, id: ServiceId) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.removed.contains(&id)
    }

    /// Watch every transition of `id`, starting from its current reading
    pub fn subscribe(&self, id: ServiceId) -> watch::Receiver<StatusReading> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.removed.contains(&id) {
            let (_, rx) = watch::channel(removed_state(id).reading());
            return rx;
        }
        state
            .entries
            .entry(id)
            .or_insert_with(CacheEntry::new)
            .tx
            .subscribe()
    }

    /// Point-in-time readings for the given ids
    pub fn snapshot(&self, ids: &[ServiceId]) -> BTreeMap<ServiceId, StatusReading> {
        ids.iter().map(|&id| (id, self.get(id))).collect()
    }

    /// Readings for every id the cache has seen and not forgotten
    pub fn snapshot_all(&self) -> BTreeMap<ServiceId, StatusReading> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .entries
            .iter()
            .map(|(&id, entry)| (id, entry.state.reading()))
            .collect()
    }
}

fn removed_state(id: ServiceId) -> ProbeState {
    ProbeState::Failed {
        reason: ProbeError::NotFound(id),
        last_good: None,
    }
}
