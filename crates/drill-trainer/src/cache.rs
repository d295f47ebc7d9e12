//! Analysis cache and in-flight queue, keyed by position fingerprint.
//!
//! Entries are write-once and never evicted. The in-flight set exists only to
//! stop duplicate work; membership is released by [`InFlightGuard`] on drop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::engines::{PositionPolicy, SearchInfo};

/// Deepest search result obtained within budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchEval {
    pub depth: u32,
    pub cp: Option<i32>,
    pub mate: Option<i32>,
    pub best_move: Option<String>,
}

impl From<SearchInfo> for SearchEval {
    fn from(info: SearchInfo) -> Self {
        Self {
            depth: info.depth,
            cp: info.cp,
            mate: info.mate,
            best_move: info.best_move,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisEntry {
    pub search: Option<SearchEval>,
    pub policy: Option<PositionPolicy>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisEntry {
    pub fn new(search: Option<SearchEval>, policy: Option<PositionPolicy>) -> Self {
        Self {
            search,
            policy,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.search.is_none() && self.policy.is_none()
    }
}

/// Progress indicator only; nothing gates on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisProgress {
    pub requested: u64,
    pub completed: u64,
    pub in_flight: usize,
    pub current: Option<String>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, AnalysisEntry>,
    in_flight: HashSet<String>,
    requested: u64,
    completed: u64,
    current: Option<String>,
}

pub struct AnalysisCache {
    state: Mutex<CacheState>,
    finished: watch::Sender<u64>,
}

impl Default for AnalysisCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisCache {
    pub fn new() -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            state: Mutex::new(CacheState::default()),
            finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff the fingerprint is neither cached nor being analyzed.
    pub fn should_analyze(&self, fingerprint: &str) -> bool {
        let state = self.lock();
        !state.entries.contains_key(fingerprint) && !state.in_flight.contains(fingerprint)
    }

    pub fn begin_analysis(&self, fingerprint: &str, description: Option<String>) {
        let mut state = self.lock();
        if state.in_flight.insert(fingerprint.to_string()) {
            state.requested += 1;
        }
        if description.is_some() {
            state.current = description;
        }
    }

    pub fn end_analysis(&self, fingerprint: &str) {
        {
            let mut state = self.lock();
            if state.in_flight.remove(fingerprint) {
                state.completed += 1;
            }
            if state.in_flight.is_empty() {
                state.current = None;
            }
        }
        self.finished.send_modify(|count| *count += 1);
    }

    /// Atomic `should_analyze` + `begin_analysis`.
    pub fn try_begin(self: &Arc<Self>, fingerprint: &str, description: Option<String>) -> Option<InFlightGuard> {
        let mut state = self.lock();
        if state.entries.contains_key(fingerprint) || !state.in_flight.insert(fingerprint.to_string()) {
            return None;
        }
        state.requested += 1;
        if description.is_some() {
            state.current = description;
        }
        Some(InFlightGuard {
            cache: Arc::clone(self),
            fingerprint: fingerprint.to_string(),
        })
    }

    /// First write wins.
    pub fn store(&self, fingerprint: &str, entry: AnalysisEntry) {
        self.lock()
            .entries
            .entry(fingerprint.to_string())
            .or_insert(entry);
    }

    pub fn get(&self, fingerprint: &str) -> Option<AnalysisEntry> {
        self.lock().entries.get(fingerprint).cloned()
    }

    pub fn is_in_flight(&self, fingerprint: &str) -> bool {
        self.lock().in_flight.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn progress(&self) -> AnalysisProgress {
        let state = self.lock();
        AnalysisProgress {
            requested: state.requested,
            completed: state.completed,
            in_flight: state.in_flight.len(),
            current: state.current.clone(),
        }
    }

    /// Ticks once per finished analysis.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.finished.subscribe()
    }

    pub fn clear(&self) {
        *self.lock() = CacheState::default();
    }
}

/// Holds a fingerprint in the in-flight set until dropped.
pub struct InFlightGuard {
    cache: Arc<AnalysisCache>,
    fingerprint: String,
}

impl InFlightGuard {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.cache.end_analysis(&self.fingerprint);
    }
}
