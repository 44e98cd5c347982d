// DIAGNOSIS TELEMETRY - counters and timers
//
// Purpose: report what a diagnosis request cost: cache hits and misses,
// monotone inferences, pruned checks, oracle invocations (driver vs workers)
// and the time spent waiting on the cache, the oracle gate and the oracle.
//
// Design: one registry per diagnosis request, shared by Arc. Counters are
// lock-free after first use; timers aggregate count/total/max. Nothing here
// influences correctness.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::info;
use serde::{Deserialize, Serialize};

/// Counter names
pub mod counters {
    pub const LOOKUPS: &str = "cache.lookups";
    pub const EXISTING_ENTRIES: &str = "cache.existing_entries";
    pub const MISSING_ENTRIES: &str = "cache.missing_entries";
    pub const ALTERNATIVE_LOOKUPS: &str = "cache.alternative_lookups";
    pub const SUPERSET_HITS: &str = "cache.superset_hits";
    pub const SUBSET_HITS: &str = "cache.subset_hits";
    pub const RESOLVE_TIMEOUTS: &str = "cache.resolve_timeouts";
    pub const PRUNED_CHECKS: &str = "cache.pruned_checks";
    pub const LOOKAHEADS: &str = "scheduler.lookaheads";
    pub const SPECULATION_NODES: &str = "scheduler.nodes";
    pub const CHECK_TASKS_CREATED: &str = "tasks.created";
    pub const CHECK_TASKS_SKIPPED: &str = "tasks.skipped";
    pub const CHECK_TASKS_CANCELLED: &str = "tasks.cancelled";
    pub const SPECULATIVE_FAILURES: &str = "tasks.speculative_failures";
    pub const DRIVER_CHECKS: &str = "oracle.driver_checks";
    pub const WORKER_CHECKS: &str = "oracle.worker_checks";
    pub const HANDLES_ACQUIRED: &str = "oracle.handles_acquired";
    pub const DIAGNOSIS_CALLS: &str = "diagnosis.recursive_calls";
}

/// Timer names
pub mod timers {
    pub const CACHE_GET: &str = "cache.get";
    pub const ALTERNATIVE_LOOKUP: &str = "cache.alternative_lookup";
    pub const CLEANUP: &str = "cache.cleanup";
    pub const GATE_WAIT: &str = "oracle.gate_wait";
    pub const ORACLE: &str = "oracle.check";
    pub const DIAGNOSIS: &str = "diagnosis.total";
}

#[derive(Debug, Default, Clone, Copy)]
struct TimerStats {
    count: u64,
    total: Duration,
    max: Duration,
}

/// Aggregated view of one timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerReport {
    pub count: u64,
    pub total_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
}

/// Point-in-time copy of every counter and timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub taken_at: String,
    pub counters: BTreeMap<String, u64>,
    pub timers: BTreeMap<String, TimerReport>,
}

impl TelemetrySnapshot {
    /// Counter value, zero when never touched
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Oracle calls performed by the driver and by workers together
    pub fn oracle_invocations(&self) -> u64 {
        self.counter(counters::DRIVER_CHECKS) + self.counter(counters::WORKER_CHECKS)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Registry of counters and timers for one diagnosis request
#[derive(Debug, Default)]
pub struct Telemetry {
    counters: DashMap<&'static str, AtomicU64>,
    timers: DashMap<&'static str, TimerStats>,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(&self, counter: &'static str) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: &'static str, amount: u64) {
        if let Some(value) = self.counters.get(counter) {
            value.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(counter)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters
            .get(counter)
            .map(|value| value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn record(&self, timer: &'static str, elapsed: Duration) {
        let mut stats = self.timers.entry(timer).or_default();
        stats.count += 1;
        stats.total += elapsed;
        if elapsed > stats.max {
            stats.max = elapsed;
        }
    }

    /// Starts a timer that records its elapsed time when dropped.
    pub fn start(&self, timer: &'static str) -> TimerGuard<'_> {
        TimerGuard {
            telemetry: self,
            timer,
            started: Instant::now(),
        }
    }

    /// Total time recorded under `timer`
    pub fn elapsed(&self, timer: &str) -> Duration {
        self.timers.get(timer).map(|stats| stats.total).unwrap_or_default()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();
        let timers = self
            .timers
            .iter()
            .map(|entry| {
                let stats = *entry.value();
                let total_us = stats.total.as_micros() as u64;
                let report = TimerReport {
                    count: stats.count,
                    total_us,
                    max_us: stats.max.as_micros() as u64,
                    mean_us: if stats.count == 0 { 0 } else { total_us / stats.count },
                };
                (entry.key().to_string(), report)
            })
            .collect();
        TelemetrySnapshot {
            taken_at: chrono::Utc::now().to_rfc3339(),
            counters,
            timers,
        }
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.timers.clear();
    }

    /// Writes every counter and timer at info level.
    pub fn log_report(&self, title: &str) {
        let snapshot = self.snapshot();
        info!("{} ({} counters, {} timers)", title, snapshot.counters.len(), snapshot.timers.len());
        for (name, value) in &snapshot.counters {
            info!("  {:<32} {}", name, value);
        }
        for (name, report) in &snapshot.timers {
            info!(
                "  {:<32} n={} total={}us mean={}us max={}us",
                name, report.count, report.total_us, report.mean_us, report.max_us
            );
        }
    }
}

/// Records the elapsed time of a scope into a [`Telemetry`] timer
pub struct TimerGuard<'a> {
    telemetry: &'a Telemetry,
    timer: &'static str,
    started: Instant,
}

impl TimerGuard<'_> {
    /// Stop now instead of at end of scope
    pub fn stop(self) {}
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.telemetry.record(self.timer, self.started.elapsed());
    }
}
