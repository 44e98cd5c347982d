// DIAGNOSIS SESSION
//
// Owns every resource of one diagnosis request: the oracle pool, the result
// cache, the look-ahead and check worker pools, and a dedicated oracle for the
// synchronous path. Nothing survives the request.
//
// SAFETY INVARIANTS:
// 1. A cache miss registers the entry before any speculation for it starts
// 2. The synchronous path never waits on an oracle-pool permit
// 3. Teardown runs exactly once, on shutdown() or on drop, whichever is first

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use paradiag_core::{ConstraintSet, DiagnosisConfig, DiagnosisResult, Oracle};
use paradiag_scheduler::{
    run_direct, CacheReport, CheckContext, LookaheadJob, OraclePool, ResultCache, ResultEntry, ShutdownOutcome,
    SpeculativeScheduler, WorkerPool,
};
use paradiag_telemetry::{counters, Telemetry};

use crate::fastdiag::ConsistencyChecker;

/// Per-request state shared by the recursion and the speculative machinery
pub struct DiagnosisSession<O: Oracle> {
    config: DiagnosisConfig,
    telemetry: Arc<Telemetry>,
    cache: Arc<ResultCache>,
    oracle_pool: Arc<OraclePool<O>>,
    lookahead_pool: Arc<WorkerPool>,
    check_pool: Arc<WorkerPool>,
    scheduler: SpeculativeScheduler<O>,
    driver_oracle: Mutex<O>,
    bootstrapped: AtomicBool,
    closed: AtomicBool,
}

impl<O: Oracle + Sync> DiagnosisSession<O> {
    /// Builds the oracle pool from `prototype` and starts both worker pools.
    /// A clone failure aborts before any search begins.
    pub fn open(prototype: &O, config: &DiagnosisConfig, telemetry: Arc<Telemetry>) -> DiagnosisResult<Self> {
        let config = config.clone().normalized();
        let oracle_pool = Arc::new(OraclePool::new(config.check_pool_size, prototype, Arc::clone(&telemetry))?);
        let driver_oracle = prototype.try_clone()?;
        let cache = Arc::new(ResultCache::new(config.resolve_wait(), Arc::clone(&telemetry)));
        let lookahead_pool = Arc::new(WorkerPool::new("lookahead", config.scheduler_pool_size)?);
        let check_pool = Arc::new(WorkerPool::new("check", config.check_pool_size)?);

        let context = CheckContext {
            pool: Arc::clone(&oracle_pool),
            cache: Arc::clone(&cache),
            telemetry: Arc::clone(&telemetry),
        };
        let scheduler = SpeculativeScheduler::new(context, Arc::clone(&check_pool), config.frontier_slack);

        info!(
            "Opened diagnosis session (lookahead pool {}, check pool {}, max level {})",
            config.scheduler_pool_size, config.check_pool_size, config.max_level
        );
        Ok(DiagnosisSession {
            config,
            telemetry,
            cache,
            oracle_pool,
            lookahead_pool,
            check_pool,
            scheduler,
            driver_oracle: Mutex::new(driver_oracle),
            bootstrapped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

impl<O: Oracle> DiagnosisSession<O> {
    pub fn config(&self) -> &DiagnosisConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn oracle_pool(&self) -> &OraclePool<O> {
        &self.oracle_pool
    }

    /// Whether `b ∪ c` is consistent.
    ///
    /// On a miss the entry is registered, a look-ahead pass for (C, B, Δ) is
    /// queued, and the answer is computed on the calling thread. On a hit the
    /// cached answer is used, waiting briefly for a live owner before
    /// computing directly.
    pub fn is_consistent(&self, c: &ConstraintSet, b: &ConstraintSet, delta: &[ConstraintSet]) -> DiagnosisResult<bool> {
        let query = b.union(c);
        if let Some(entry) = self.cache.get(&query) {
            return self.use_existing(&entry);
        }

        let registration = self.cache.register(query, true);
        if !registration.inserted {
            return self.use_existing(&registration.entry);
        }

        self.launch_lookahead(c, b, delta);
        if let Some(consistent) = registration.entry.consistency() {
            debug!("Inferred {} -> {} from the cache", registration.entry.set(), consistent);
            return Ok(consistent);
        }
        self.check_directly(&registration.entry)
    }

    fn use_existing(&self, entry: &Arc<ResultEntry>) -> DiagnosisResult<bool> {
        if let Some(consistent) = self.cache.await_entry(entry) {
            return Ok(consistent);
        }
        if let Some(owner) = entry.owner() {
            if owner.cancel() {
                self.telemetry.incr(counters::CHECK_TASKS_CANCELLED);
                debug!("Took over queued check of {}", entry.set());
            }
        }
        self.check_directly(entry)
    }

    fn check_directly(&self, entry: &Arc<ResultEntry>) -> DiagnosisResult<bool> {
        let mut oracle = self.driver_oracle.lock();
        run_direct(entry, &mut *oracle, &self.cache, &self.telemetry)
    }

    /// Effective depth bound for the next pass. The first pass of a request
    /// configured with depth 1 goes one level deeper.
    fn next_max_level(&self) -> usize {
        let configured = self.config.max_level;
        if configured == 1
            && self
                .bootstrapped
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return configured + 1;
        }
        configured
    }

    fn launch_lookahead(&self, c: &ConstraintSet, b: &ConstraintSet, delta: &[ConstraintSet]) {
        let max_level = self.next_max_level();
        let job = LookaheadJob::new(self.scheduler.clone(), c.clone(), b.clone(), delta.to_vec(), max_level);
        if let Err(e) = self.lookahead_pool.submit(Box::new(job)) {
            warn!("Look-ahead for {} not started: {}", b.union(c), e);
        }
    }

    /// Drains both worker pools, closes the oracle gate and clears the cache.
    /// Returns the cache contents as they were before clearing; later calls
    /// return `None`.
    pub fn shutdown(&self) -> Option<CacheReport> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let timeout = self.config.drain_timeout();
        for pool in [&self.lookahead_pool, &self.check_pool] {
            if let ShutdownOutcome::Forced(remaining) = pool.shutdown(timeout) {
                warn!("{} pool forced down with {} jobs outstanding", pool.name(), remaining);
            }
        }
        self.oracle_pool.close();

        let report = self.cache.clear();
        debug!("Diagnosis session closed");
        Some(report)
    }
}

impl<O: Oracle> ConsistencyChecker for DiagnosisSession<O> {
    fn is_consistent(&mut self, c: &ConstraintSet, b: &ConstraintSet, delta: &[ConstraintSet]) -> DiagnosisResult<bool> {
        DiagnosisSession::is_consistent(self, c, b, delta)
    }
}

impl<O: Oracle> Drop for DiagnosisSession<O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paradiag_core::{Catalog, ConflictOracle};
    use paradiag_scheduler::EntryStatus;

    fn session(oracle: &ConflictOracle, config: DiagnosisConfig) -> DiagnosisSession<ConflictOracle> {
        DiagnosisSession::open(oracle, &config, Telemetry::new()).unwrap()
    }

    #[test]
    fn test_bootstrap_bumps_depth_once() {
        let oracle = ConflictOracle::new(Vec::new());
        let session = session(&oracle, DiagnosisConfig::default());
        assert_eq!(session.next_max_level(), 2);
        assert_eq!(session.next_max_level(), 1);
        assert_eq!(session.next_max_level(), 1);

        let deeper = self::session(&oracle, DiagnosisConfig::default().with_max_level(3));
        assert_eq!(deeper.next_max_level(), 3);
    }

    #[test]
    fn test_miss_then_hit_reuses_answer() {
        let mut catalog = Catalog::new();
        let oracle = ConflictOracle::new(vec![catalog.set(["a", "b"])]);
        let session = session(&oracle, DiagnosisConfig::default());
        let c = catalog.set(["a", "b", "c"]);
        let b = ConstraintSet::empty();

        assert!(!session.is_consistent(&c, &b, &[]).unwrap());
        let entry = session.cache().get(&c).unwrap();
        assert_eq!(entry.status(), EntryStatus::Done(false));

        let before = oracle.invocations();
        assert!(!session.is_consistent(&c, &b, &[]).unwrap());
        assert_eq!(oracle.invocations(), before);
        assert_eq!(session.telemetry().counter(counters::DRIVER_CHECKS), 1);
    }

    #[test]
    fn test_shutdown_reports_once_and_clears() {
        let mut catalog = Catalog::new();
        let oracle = ConflictOracle::new(vec![catalog.set(["a"])]);
        let session = session(&oracle, DiagnosisConfig::default());
        session.is_consistent(&catalog.set(["a"]), &ConstraintSet::empty(), &[]).unwrap();

        let report = session.shutdown().unwrap();
        assert!(report.entries >= 1);
        assert!(session.cache().is_empty());
        assert!(session.shutdown().is_none());
    }

    #[test]
    fn test_clone_failure_aborts_open() {
        let oracle = ConflictOracle::new(Vec::new()).failing_clones();
        let result = DiagnosisSession::open(&oracle, &DiagnosisConfig::default(), Telemetry::new());
        assert!(result.is_err());
    }
}
