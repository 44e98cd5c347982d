// RESULT CACHE
//
// Memoizes oracle answers for one diagnosis request, keyed on the full
// constraint set (the fingerprint only picks the bucket, equality decides).
// Consistency is monotone, so a cached answer also decides every subset of a
// consistent set and every superset of an inconsistent one.
//
// SAFETY INVARIANTS:
// 1. An entry goes Pending -> Done at most once; later writes are no-ops
// 2. At most one oracle computation per set: every computation runs under the
//    entry's compute lock and re-checks Done first
// 3. No map mutation happens while an iteration over the map is in progress

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use paradiag_core::ConstraintSet;
use paradiag_telemetry::{counters, timers, Telemetry};

use crate::task::TaskHandle;

/// How a Done entry got its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Asked the oracle
    Oracle,
    /// Decided from a cached witness at registration
    Inferred,
    /// Decided while its task was still queued
    Pruned,
}

/// Observable state of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Done(bool),
}

#[derive(Debug, Default)]
struct EntryState {
    consistent: Option<bool>,
    resolution: Option<Resolution>,
    owner: Option<Arc<TaskHandle>>,
    failure: Option<String>,
}

/// Cached answer for one constraint set
#[derive(Debug)]
pub struct ResultEntry {
    set: ConstraintSet,
    state: Mutex<EntryState>,
    resolved: Condvar,
    compute: Mutex<()>,
}

impl ResultEntry {
    pub fn new(set: ConstraintSet) -> Self {
        ResultEntry {
            set,
            state: Mutex::new(EntryState::default()),
            resolved: Condvar::new(),
            compute: Mutex::new(()),
        }
    }

    pub fn set(&self) -> &ConstraintSet {
        &self.set
    }

    pub fn status(&self) -> EntryStatus {
        match self.state.lock().consistent {
            Some(consistent) => EntryStatus::Done(consistent),
            None => EntryStatus::Pending,
        }
    }

    pub fn consistency(&self) -> Option<bool> {
        self.state.lock().consistent
    }

    pub fn is_done(&self) -> bool {
        self.consistency().is_some()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.state.lock().resolution
    }

    /// Records the answer. Returns false if the entry was already Done.
    pub fn complete(&self, consistent: bool, resolution: Resolution) -> bool {
        let mut state = self.state.lock();
        if state.consistent.is_some() {
            return false;
        }
        state.consistent = Some(consistent);
        state.resolution = Some(resolution);
        state.failure = None;
        drop(state);
        self.resolved.notify_all();
        true
    }

    /// Settles the entry with an answer decided elsewhere, cancelling its
    /// owner first. Only a still-queued owner can be cancelled; returns
    /// false if the entry is Done or its owner already started.
    pub fn prune(&self, consistent: bool) -> bool {
        let mut state = self.state.lock();
        if state.consistent.is_some() {
            return false;
        }
        // cancelling and settling happen under one lock so no reader sees a
        // dead owner on a Pending entry
        match &state.owner {
            Some(owner) if owner.cancel() => {}
            _ => return false,
        }
        state.consistent = Some(consistent);
        state.resolution = Some(Resolution::Pruned);
        state.failure = None;
        drop(state);
        self.resolved.notify_all();
        true
    }

    /// Makes `owner` the task responsible for this entry unless a live task
    /// already is.
    pub fn attach(&self, owner: Arc<TaskHandle>) {
        let mut state = self.state.lock();
        let replace = match &state.owner {
            Some(current) => !current.is_live(),
            None => true,
        };
        if replace {
            state.owner = Some(owner);
        }
    }

    pub fn owner(&self) -> Option<Arc<TaskHandle>> {
        self.state.lock().owner.clone()
    }

    /// Whether a queued or running task is working on this entry
    pub fn has_live_owner(&self) -> bool {
        self.state
            .lock()
            .owner
            .as_ref()
            .map(|owner| owner.is_live())
            .unwrap_or(false)
    }

    /// Notes that the owning computation failed and wakes waiters.
    pub fn record_failure(&self, reason: String) {
        let mut state = self.state.lock();
        if state.consistent.is_none() {
            state.failure = Some(reason);
        }
        drop(state);
        self.resolved.notify_all();
    }

    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    /// Waits up to `timeout` for the entry to become Done. Returns early if
    /// the owning task fails.
    pub fn wait_for(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.consistent.is_some() || state.failure.is_some() {
                return state.consistent;
            }
            if self.resolved.wait_until(&mut state, deadline).timed_out() {
                return state.consistent;
            }
        }
    }

    /// Serializes computations of this entry.
    pub fn lock_compute(&self) -> MutexGuard<'_, ()> {
        self.compute.lock()
    }
}

/// Outcome of [`ResultCache::register`]
#[derive(Debug, Clone)]
pub struct Registration {
    pub entry: Arc<ResultEntry>,
    /// The call created the entry
    pub inserted: bool,
}

/// Entry counts, logged when a request tears its cache down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReport {
    pub entries: usize,
    pub pending: usize,
    pub consistent: usize,
    pub inconsistent: usize,
    pub by_oracle: usize,
    pub inferred: usize,
    pub pruned: usize,
    pub failed: usize,
}

/// Shared memo of consistency answers for one diagnosis request
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<ConstraintSet, Arc<ResultEntry>>,
    resolve_wait: Duration,
    task_ids: AtomicU64,
    telemetry: Arc<Telemetry>,
}

impl ResultCache {
    pub fn new(resolve_wait: Duration, telemetry: Arc<Telemetry>) -> Self {
        ResultCache {
            entries: DashMap::new(),
            resolve_wait,
            task_ids: AtomicU64::new(0),
            telemetry,
        }
    }

    /// Task identifiers are per request and start at zero.
    pub fn next_task_id(&self) -> u64 {
        self.task_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn contains(&self, set: &ConstraintSet) -> bool {
        self.entries.contains_key(set)
    }

    pub fn get(&self, set: &ConstraintSet) -> Option<Arc<ResultEntry>> {
        self.telemetry.incr(counters::LOOKUPS);
        let found = self.entries.get(set).map(|entry| Arc::clone(entry.value()));
        if found.is_some() {
            self.telemetry.incr(counters::EXISTING_ENTRIES);
        } else {
            self.telemetry.incr(counters::MISSING_ENTRIES);
        }
        found
    }

    /// Inserts `entry` unless the set is already present. Returns the entry
    /// now stored and whether it was this call that stored it.
    pub fn put_if_absent(&self, entry: Arc<ResultEntry>) -> (Arc<ResultEntry>, bool) {
        match self.entries.entry(entry.set().clone()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
                (entry, true)
            }
        }
    }

    /// Get-or-create for `set`. A freshly created entry is resolved right
    /// away when `infer` is set and a cached witness decides it.
    pub fn register(&self, set: ConstraintSet, infer: bool) -> Registration {
        let (entry, inserted) = self.put_if_absent(Arc::new(ResultEntry::new(set)));
        if inserted && infer {
            if let Some((witness, consistent)) = self.find_alternative(entry.set()) {
                if entry.complete(consistent, Resolution::Inferred) {
                    trace!("Inferred {} -> {} from {}", entry.set(), consistent, witness);
                }
            }
        }
        Registration { entry, inserted }
    }

    /// Answer for `set` if known. Waits briefly when a live task owns a
    /// pending entry; `None` means the caller has to compute it.
    pub fn resolve(&self, set: &ConstraintSet) -> Option<bool> {
        let entry = self.get(set)?;
        self.await_entry(&entry)
    }

    /// [`ResultCache::resolve`] for an entry the caller already holds.
    pub fn await_entry(&self, entry: &ResultEntry) -> Option<bool> {
        let _timer = self.telemetry.start(timers::CACHE_GET);
        if let Some(consistent) = entry.consistency() {
            return Some(consistent);
        }
        if !entry.has_live_owner() {
            return None;
        }
        let outcome = entry.wait_for(self.resolve_wait);
        if outcome.is_none() {
            self.telemetry.incr(counters::RESOLVE_TIMEOUTS);
            trace!("Timed out waiting {:?} for {}", self.resolve_wait, entry.set());
        }
        outcome
    }

    /// First Done entry that decides `query` by monotonicity: a consistent
    /// superset or an inconsistent subset. Returns the witness and the answer.
    pub fn find_alternative(&self, query: &ConstraintSet) -> Option<(ConstraintSet, bool)> {
        let _timer = self.telemetry.start(timers::ALTERNATIVE_LOOKUP);
        self.telemetry.incr(counters::ALTERNATIVE_LOOKUPS);
        for item in self.entries.iter() {
            let (set, entry) = (item.key(), item.value());
            if set == query {
                continue;
            }
            match entry.consistency() {
                Some(true) if set.is_superset_of(query) => {
                    self.telemetry.incr(counters::SUPERSET_HITS);
                    return Some((set.clone(), true));
                }
                Some(false) if set.is_subset_of(query) => {
                    self.telemetry.incr(counters::SUBSET_HITS);
                    return Some((set.clone(), false));
                }
                _ => {}
            }
        }
        None
    }

    /// After `resolved` got its answer, settles every pending entry the
    /// answer decides whose task has not started yet. Returns how many
    /// checks were pruned.
    pub fn cleanup(&self, resolved: &ConstraintSet, consistent: bool) -> usize {
        let _timer = self.telemetry.start(timers::CLEANUP);
        let decided: Vec<Arc<ResultEntry>> = self
            .entries
            .iter()
            .filter(|item| {
                let set = item.key();
                let covered = if consistent {
                    resolved.is_superset_of(set)
                } else {
                    set.is_superset_of(resolved)
                };
                covered && set != resolved && !item.value().is_done()
            })
            .map(|item| Arc::clone(item.value()))
            .collect();

        let mut pruned = 0;
        for entry in decided {
            if entry.prune(consistent) {
                pruned += 1;
                trace!("Pruned {} -> {} via {}", entry.set(), consistent, resolved);
            }
        }
        if pruned > 0 {
            self.telemetry.add(counters::PRUNED_CHECKS, pruned as u64);
            debug!("Pruned {} pending checks after {} -> {}", pruned, resolved, consistent);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn describe(&self) -> CacheReport {
        let mut report = CacheReport::default();
        for item in self.entries.iter() {
            let entry = item.value();
            report.entries += 1;
            match entry.status() {
                EntryStatus::Pending => report.pending += 1,
                EntryStatus::Done(true) => report.consistent += 1,
                EntryStatus::Done(false) => report.inconsistent += 1,
            }
            match entry.resolution() {
                Some(Resolution::Oracle) => report.by_oracle += 1,
                Some(Resolution::Inferred) => report.inferred += 1,
                Some(Resolution::Pruned) => report.pruned += 1,
                None => {}
            }
            if entry.failure().is_some() {
                report.failed += 1;
            }
            trace!("  {} -> {:?} ({:?})", entry.set(), entry.status(), entry.resolution());
        }
        report
    }

    /// Drops every entry, logging and returning what the request
    /// accumulated.
    pub fn clear(&self) -> CacheReport {
        let report = self.describe();
        info!(
            "Clearing result cache: {} entries ({} consistent, {} inconsistent, {} pending, {} pruned, {} inferred)",
            report.entries, report.consistent, report.inconsistent, report.pending, report.pruned, report.inferred
        );
        self.entries.clear();
        report
    }
}
