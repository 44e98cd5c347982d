//! Single-threaded reference diagnoser: the same recursion, one oracle, no
//! cache and no speculation. Used as a baseline for results and costs.

use std::sync::Arc;

use tracing::trace;

use paradiag_core::{ConstraintSet, DiagnosisResult, Oracle};
use paradiag_telemetry::{counters, timers, Telemetry, TelemetrySnapshot};

use crate::fastdiag::{self, ConsistencyChecker};

struct DirectChecker<'a, O: Oracle> {
    oracle: &'a mut O,
    telemetry: &'a Telemetry,
}

impl<O: Oracle> ConsistencyChecker for DirectChecker<'_, O> {
    fn is_consistent(&mut self, c: &ConstraintSet, b: &ConstraintSet, _delta: &[ConstraintSet]) -> DiagnosisResult<bool> {
        let query = b.union(c);
        let _timer = self.telemetry.start(timers::ORACLE);
        let consistent = self.oracle.is_consistent(&query)?;
        self.telemetry.incr(counters::DRIVER_CHECKS);
        trace!("Sequential check {} -> {}", query, consistent);
        Ok(consistent)
    }
}

pub struct SequentialDiagnoser<O: Oracle> {
    oracle: O,
}

impl<O: Oracle> SequentialDiagnoser<O> {
    pub fn new(oracle: O) -> Self {
        SequentialDiagnoser { oracle }
    }

    pub fn find_diagnosis(&mut self, c: &ConstraintSet, b: &ConstraintSet) -> DiagnosisResult<ConstraintSet> {
        self.diagnose(c, b).map(|(diagnosis, _)| diagnosis)
    }

    /// Diagnosis plus the counters of the run
    pub fn diagnose(&mut self, c: &ConstraintSet, b: &ConstraintSet) -> DiagnosisResult<(ConstraintSet, TelemetrySnapshot)> {
        let telemetry: Arc<Telemetry> = Telemetry::new();
        let mut checker = DirectChecker {
            oracle: &mut self.oracle,
            telemetry: &telemetry,
        };
        let diagnosis = fastdiag::find_diagnosis(&mut checker, c, b, &telemetry)?;
        Ok((diagnosis, telemetry.snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paradiag_core::{Catalog, ConflictOracle};

    #[test]
    fn test_sequential_counts_every_check() {
        let mut catalog = Catalog::new();
        let oracle = ConflictOracle::new(vec![catalog.set(["a", "b"]), catalog.set(["c", "d"])]);
        let counter = oracle.invocation_counter();
        let mut diagnoser = SequentialDiagnoser::new(oracle);

        let (diagnosis, snapshot) = diagnoser
            .diagnose(&catalog.set(["a", "b", "c", "d"]), &ConstraintSet::empty())
            .unwrap();
        assert_eq!(diagnosis.len(), 2);
        assert_eq!(snapshot.counter(counters::DRIVER_CHECKS), counter.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_sequential_surfaces_oracle_failure() {
        let mut catalog = Catalog::new();
        let c = catalog.set(["a", "b"]);
        let oracle = ConflictOracle::new(vec![catalog.set(["a"])]).failing_on(c.clone());
        let mut diagnoser = SequentialDiagnoser::new(oracle);
        assert!(diagnoser.find_diagnosis(&c, &ConstraintSet::empty()).is_err());
    }
}
