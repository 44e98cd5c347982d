// DIAGNOSIS DRIVER TESTS
// Sessions and full requests against a counting oracle
//
// TESTS COVER:
// 1. Inconsistent query answered and cached as Done
// 2. Simultaneous identical queries cost one oracle call
// 3. Queued superset check pruned by an inconsistent subset answer
// 3a. Existing entries: waiting on a running check, taking over a queued
//     one, recomputing after a failed one
// 4. No constraint set reaches the oracle twice during a request
// 5. Clone and check failures abort the request cleanly
// 6. Parallel and sequential diagnosers agree

#[cfg(test)]
mod diagnosis_tests {
    use paradiag_core::{
        Catalog, ConflictOracle, ConstraintSet, DiagnosisConfig, DiagnosisError, Oracle, OracleError,
    };
    use paradiag_engine::{DiagnosisSession, ParallelDiagnoser, SequentialDiagnoser};
    use paradiag_scheduler::{EntryStatus, Resolution, TaskHandle, TaskState};
    use paradiag_telemetry::{counters, Telemetry};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    /// Conflict oracle that records how often each set was checked
    struct RecordingOracle {
        inner: ConflictOracle,
        seen: Arc<Mutex<HashMap<ConstraintSet, usize>>>,
    }

    impl RecordingOracle {
        fn new(inner: ConflictOracle) -> Self {
            RecordingOracle {
                inner,
                seen: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn checks_of(&self, set: &ConstraintSet) -> usize {
            self.seen.lock().get(set).copied().unwrap_or(0)
        }

        fn max_checks_per_set(&self) -> usize {
            self.seen.lock().values().copied().max().unwrap_or(0)
        }
    }

    impl Oracle for RecordingOracle {
        fn is_consistent(&mut self, constraints: &ConstraintSet) -> Result<bool, OracleError> {
            *self.seen.lock().entry(constraints.clone()).or_insert(0) += 1;
            self.inner.is_consistent(constraints)
        }

        fn try_clone(&self) -> Result<Self, OracleError> {
            Ok(RecordingOracle {
                inner: self.inner.try_clone()?,
                seen: Arc::clone(&self.seen),
            })
        }
    }

    fn config() -> DiagnosisConfig {
        DiagnosisConfig::default().with_check_pool_size(4).with_max_level(2)
    }

    #[test_log::test]
    fn test_inconsistent_query_is_cached_done() {
        let mut catalog = Catalog::new();
        let oracle = ConflictOracle::new(vec![catalog.set(["a", "b"])]);
        let session = DiagnosisSession::open(&oracle, &config(), Telemetry::new()).unwrap();
        let c = catalog.set(["a", "b", "c"]);

        assert!(!session.is_consistent(&c, &ConstraintSet::empty(), &[]).unwrap());
        let entry = session.cache().get(&c).unwrap();
        assert_eq!(entry.status(), EntryStatus::Done(false));
        assert!(session.shutdown().is_some());
    }

    #[test]
    fn test_simultaneous_identical_queries_check_once() {
        let mut catalog = Catalog::new();
        let inner = ConflictOracle::new(vec![catalog.set(["a", "b"])]).with_latency(Duration::from_millis(20));
        let oracle = RecordingOracle::new(inner);
        let session = Arc::new(DiagnosisSession::open(&oracle, &config(), Telemetry::new()).unwrap());
        let c = catalog.set(["a", "b", "c"]);
        let barrier = Arc::new(Barrier::new(2));

        let callers: Vec<_> = (0..2)
            .map(|_| {
                let session = Arc::clone(&session);
                let barrier = Arc::clone(&barrier);
                let c = c.clone();
                thread::spawn(move || {
                    barrier.wait();
                    session.is_consistent(&c, &ConstraintSet::empty(), &[]).unwrap()
                })
            })
            .collect();
        let answers: Vec<bool> = callers.into_iter().map(|caller| caller.join().unwrap()).collect();

        assert_eq!(answers, vec![false, false]);
        assert_eq!(oracle.checks_of(&c), 1);
        session.shutdown();
    }

    #[test]
    fn test_queued_superset_pruned_by_inconsistent_subset() {
        let mut catalog = Catalog::new();
        let oracle = RecordingOracle::new(ConflictOracle::new(vec![catalog.set(["a", "b"])]));
        let session = DiagnosisSession::open(&oracle, &config(), Telemetry::new()).unwrap();
        let superset = catalog.set(["a", "b", "c"]);

        let pending = session.cache().register(superset.clone(), false).entry;
        let queued = TaskHandle::new(1000);
        pending.attach(Arc::clone(&queued));

        assert!(!session.is_consistent(&catalog.set(["a", "b"]), &ConstraintSet::empty(), &[]).unwrap());
        assert_eq!(pending.status(), EntryStatus::Done(false));
        assert_eq!(pending.resolution(), Some(Resolution::Pruned));
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert_eq!(oracle.checks_of(&superset), 0);
        assert!(session.telemetry().counter(counters::PRUNED_CHECKS) >= 1);
    }

    #[test]
    fn test_query_waits_for_running_check() {
        let mut catalog = Catalog::new();
        let oracle = RecordingOracle::new(ConflictOracle::new(vec![catalog.set(["a", "b"])]));
        let config = config().with_resolve_wait(Duration::from_millis(500));
        let session = DiagnosisSession::open(&oracle, &config, Telemetry::new()).unwrap();
        let query = catalog.set(["a", "b", "c"]);

        let entry = session.cache().register(query.clone(), false).entry;
        let running = TaskHandle::new(1000);
        entry.attach(Arc::clone(&running));
        assert!(running.try_start());

        let worker = {
            let entry = Arc::clone(&entry);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                entry.complete(false, Resolution::Oracle);
                running.finish();
            })
        };

        assert!(!session.is_consistent(&query, &ConstraintSet::empty(), &[]).unwrap());
        worker.join().unwrap();
        assert_eq!(oracle.checks_of(&query), 0);
        assert_eq!(running.state(), TaskState::Done);
        session.shutdown();
    }

    #[test]
    fn test_query_takes_over_queued_check() {
        let mut catalog = Catalog::new();
        let oracle = RecordingOracle::new(ConflictOracle::new(vec![catalog.set(["a", "b"])]));
        let config = config().with_resolve_wait(Duration::from_millis(10));
        let session = DiagnosisSession::open(&oracle, &config, Telemetry::new()).unwrap();
        let query = catalog.set(["a", "c"]);

        let entry = session.cache().register(query.clone(), false).entry;
        let queued = TaskHandle::new(1000);
        entry.attach(Arc::clone(&queued));

        assert!(session.is_consistent(&query, &ConstraintSet::empty(), &[]).unwrap());
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert_eq!(oracle.checks_of(&query), 1);
        assert_eq!(entry.status(), EntryStatus::Done(true));
        assert_eq!(entry.resolution(), Some(Resolution::Oracle));
        assert!(session.telemetry().counter(counters::CHECK_TASKS_CANCELLED) >= 1);
        session.shutdown();
    }

    #[test]
    fn test_failed_speculative_check_is_recomputed() {
        let mut catalog = Catalog::new();
        let query = catalog.set(["a", "b", "c"]);
        let conflicts = vec![catalog.set(["a", "b"])];

        let mark_failed = |session: &DiagnosisSession<RecordingOracle>| {
            let entry = session.cache().register(query.clone(), false).entry;
            let owner = TaskHandle::new(1000);
            entry.attach(Arc::clone(&owner));
            assert!(owner.try_start());
            owner.fail("speculative check failed".to_string());
            entry.record_failure("speculative check failed".to_string());
            entry
        };

        let oracle = RecordingOracle::new(ConflictOracle::new(conflicts.clone()));
        let session = DiagnosisSession::open(&oracle, &config(), Telemetry::new()).unwrap();
        let entry = mark_failed(&session);
        assert!(!session.is_consistent(&query, &ConstraintSet::empty(), &[]).unwrap());
        assert_eq!(oracle.checks_of(&query), 1);
        assert_eq!(entry.status(), EntryStatus::Done(false));
        assert_eq!(entry.failure(), None);
        session.shutdown();

        let failing = RecordingOracle::new(ConflictOracle::new(conflicts).failing_on(query.clone()));
        let session = DiagnosisSession::open(&failing, &config(), Telemetry::new()).unwrap();
        let entry = mark_failed(&session);
        let result = session.is_consistent(&query, &ConstraintSet::empty(), &[]);
        assert!(matches!(result, Err(DiagnosisError::Oracle(OracleError::CheckFailed { .. }))));
        assert_eq!(failing.checks_of(&query), 1);
        assert_eq!(entry.status(), EntryStatus::Pending);
        assert!(entry.failure().is_some());
        session.shutdown();
    }

    #[test]
    fn test_no_set_checked_twice_during_request() {
        let mut catalog = Catalog::new();
        let names: Vec<String> = (0..12).map(|i| format!("c{}", i)).collect();
        let conflicts = vec![
            catalog.set(["c1", "c4"]),
            catalog.set(["c6", "c7", "c9"]),
            catalog.set(["c10"]),
        ];
        let oracle = RecordingOracle::new(ConflictOracle::new(conflicts).with_latency(Duration::from_millis(1)));
        let c = catalog.set(names.iter().map(String::as_str));
        let diagnoser = ParallelDiagnoser::new(oracle, config());

        let report = diagnoser.diagnose(&c, &ConstraintSet::empty()).unwrap();
        assert_eq!(diagnoser.prototype().max_checks_per_set(), 1);
        assert!(report.diagnosis.contains(catalog.id("c10").unwrap()));
        assert_eq!(report.diagnosis.len(), 3);
    }

    #[test]
    fn test_clone_failure_aborts_before_search() {
        let mut catalog = Catalog::new();
        let oracle = ConflictOracle::new(vec![catalog.set(["a"])]).failing_clones();
        let counter = oracle.invocation_counter();
        let diagnoser = ParallelDiagnoser::new(oracle, config());

        let result = diagnoser.find_diagnosis(&catalog.set(["a", "b"]), &ConstraintSet::empty());
        assert!(matches!(result, Err(DiagnosisError::Oracle(OracleError::CloneFailed(_)))));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_synchronous_check_failure_surfaces() {
        let mut catalog = Catalog::new();
        let c = catalog.set(["a", "b", "c"]);
        let oracle = ConflictOracle::new(vec![catalog.set(["a", "b"])]).failing_on(c.clone());
        let diagnoser = ParallelDiagnoser::new(oracle, config());

        let result = diagnoser.find_diagnosis(&c, &ConstraintSet::empty());
        assert!(matches!(result, Err(DiagnosisError::Oracle(OracleError::CheckFailed { .. }))));
    }

    #[test]
    fn test_requests_do_not_share_state() {
        let mut catalog = Catalog::new();
        let oracle = RecordingOracle::new(ConflictOracle::new(vec![catalog.set(["a", "b"])]));
        let diagnoser = ParallelDiagnoser::new(oracle, config());
        let c = catalog.set(["a", "b", "c"]);

        let first = diagnoser.diagnose(&c, &ConstraintSet::empty()).unwrap();
        let second = diagnoser.diagnose(&c, &ConstraintSet::empty()).unwrap();
        assert_eq!(first.diagnosis, second.diagnosis);
        assert_eq!(diagnoser.prototype().checks_of(&c), 2);
    }

    fn subset(catalog: &mut Catalog, names: &[String], mask: u16) -> ConstraintSet {
        catalog.set(
            names
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, name)| name.as_str()),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_parallel_matches_sequential(
            masks in prop::collection::vec(1u16..256, 1..4),
        ) {
            let names: Vec<String> = (0..8).map(|i| format!("k{}", i)).collect();
            let mut catalog = Catalog::new();
            let c = catalog.set(names.iter().map(String::as_str));
            let conflicts: Vec<ConstraintSet> = masks.iter().map(|mask| subset(&mut catalog, &names, *mask)).collect();

            let parallel = ParallelDiagnoser::new(ConflictOracle::new(conflicts.clone()), config())
                .find_diagnosis(&c, &ConstraintSet::empty())
                .unwrap();
            let sequential = SequentialDiagnoser::new(ConflictOracle::new(conflicts))
                .find_diagnosis(&c, &ConstraintSet::empty())
                .unwrap();
            prop_assert_eq!(parallel, sequential);
        }
    }
}
