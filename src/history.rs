//! Bounded per-service history of check results

use crate::errors::{ProbeError, ProbeResult};
use crate::model::{CheckResult, ServiceId, normalize_oldest_first};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Ring of the most recent results for one service, oldest first
#[derive(Debug, Clone)]
struct ServiceHistory {
    entries: VecDeque<CheckResult>,
    capacity: usize,
    /// Seeded from the durable store, which stays the source of truth
    store_backed: bool,
}

impl ServiceHistory {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            store_backed: false,
        }
    }

    /// Results are keyed by timestamp; only the newest end is scanned since
    /// a duplicate can only come from the tail a seed just delivered.
    fn contains(&self, result: &CheckResult) -> bool {
        self.entries
            .iter()
            .rev()
            .take_while(|existing| existing.timestamp >= result.timestamp)
            .any(|existing| existing.timestamp == result.timestamp)
    }

    fn push(&mut self, result: CheckResult) -> bool {
        if self.contains(&result) {
            return false;
        }

        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
        true
    }

    fn grow_to(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.capacity = capacity;
        }
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    fn tail(&self, limit: usize) -> Vec<CheckResult> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    services: HashMap<ServiceId, ServiceHistory>,
    removed: HashSet<ServiceId>,
}

/// Thread-safe, bounded history store partitioned by service id.
///
/// Every ring retains at least the largest window a reader has asked for,
/// up to `max_capacity`. Nothing here awaits; locks are held only for the
/// duration of a copy.
#[derive(Debug)]
pub struct HistoryBuffer {
    state: RwLock<HistoryState>,
    default_capacity: usize,
    max_capacity: usize,
}

impl HistoryBuffer {
    pub fn new(default_capacity: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(1);
        Self {
            state: RwLock::new(HistoryState::default()),
            default_capacity: default_capacity.clamp(1, max_capacity),
            max_capacity,
        }
    }

    fn ring<'a>(&self, state: &'a mut HistoryState, id: ServiceId) -> &'a mut ServiceHistory {
        let capacity = self.default_capacity;
        state
            .services
            .entry(id)
            .or_insert_with(|| ServiceHistory::new(capacity))
    }

    /// Append a live result in arrival order.
    ///
    /// Returns false when the result was already present or the service
    /// has been removed.
    pub fn append(&self, id: ServiceId, result: CheckResult) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.removed.contains(&id) {
            return false;
        }

        let appended = self.ring(&mut state, id).push(result);
        if !appended {
            debug!("Skipped duplicate check result for service {}", id);
        }
        appended
    }

    /// Most recent `limit` results, oldest first.
    ///
    /// Reading also raises an existing ring's capacity to `limit` (bounded by
    /// the configured ceiling) so later appends keep the window filled. Ids
    /// with no ring read as empty and allocate nothing.
    pub fn read(&self, id: ServiceId, limit: usize) -> ProbeResult<Vec<CheckResult>> {
        let capacity = limit.min(self.max_capacity);
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.removed.contains(&id) {
                return Err(ProbeError::NotFound(id));
            }
            match state.services.get(&id) {
                None => return Ok(Vec::new()),
                Some(ring) if ring.capacity >= capacity => return Ok(ring.tail(limit)),
                Some(_) => {}
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.removed.contains(&id) {
            return Err(ProbeError::NotFound(id));
        }
        Ok(state
            .services
            .get_mut(&id)
            .map(|ring| {
                ring.grow_to(capacity);
                ring.tail(limit)
            })
            .unwrap_or_default())
    }

    /// Seed from the durable store.
    ///
    /// The stored sequence becomes the base of the ring; live results that
    /// arrived after its newest entry are kept on top of it.
    ///
    /// Once seeded, the ring is store-backed: revalidation reloads it from
    /// the store instead of appending live results.
    pub fn seed(&self, id: ServiceId, results: Vec<CheckResult>) {
        let results = normalize_oldest_first(results);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.removed.contains(&id) {
            return;
        }

        let seeded = results.len();
        let capacity = seeded.min(self.max_capacity);
        let ring = self.ring(&mut state, id);
        ring.store_backed = true;
        ring.grow_to(capacity);

        let Some(newest) = results.last().map(|r| r.timestamp) else {
            return;
        };

        let live: Vec<CheckResult> = ring
            .entries
            .drain(..)
            .filter(|existing| existing.timestamp > newest)
            .collect();

        ring.entries.extend(results);
        ring.entries.extend(live);
        ring.trim();

        debug!(
            "Seeded history for service {} with {} results, {} retained",
            id,
            seeded,
            ring.entries.len()
        );
    }

    /// Window to reload from the store for a store-backed ring
    pub fn store_window(&self, id: ServiceId) -> Option<usize> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .services
            .get(&id)
            .filter(|ring| ring.store_backed)
            .map(|ring| ring.capacity)
    }

    /// Newest retained result
    pub fn latest(&self, id: ServiceId) -> Option<CheckResult> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .services
            .get(&id)
            .and_then(|ring| ring.entries.back().cloned())
    }

    /// Drop everything held for a deleted service; later reads report NotFound
    pub fn forget(&self, id: ServiceId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.services.remove(&id);
        state.removed.insert(id);
        debug!("Forgot history for service {}", id);
    }

    pub fn is_removed(&self, id: ServiceId) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.removed.contains(&id)
    }

    /// Current retained length and capacity for one service
    pub fn size(&self, id: ServiceId) -> Option<(usize, usize)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .services
            .get(&id)
            .map(|ring| (ring.entries.len(), ring.capacity))
    }

    pub fn stats(&self) -> HistoryStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        HistoryStats {
            services: state.services.len(),
            entries: state.services.values().map(|r| r.entries.len()).sum(),
            capacity: state.services.values().map(|r| r.capacity).sum(),
        }
    }
}

/// History buffer statistics
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryStats {
    pub services: usize,
    pub entries: usize,
    pub capacity: usize,
}
