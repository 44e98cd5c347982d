// PARALLEL DIAGNOSER
//
// Entry point for diagnosis requests. Each request opens a fresh session
// (oracle clones, cache, worker pools), runs the FastDiag recursion against
// it, and tears the session down before returning, on success and on error.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use paradiag_core::{ConstraintSet, DiagnosisConfig, DiagnosisResult, Oracle};
use paradiag_scheduler::CacheReport;
use paradiag_telemetry::{Telemetry, TelemetrySnapshot};

use crate::fastdiag;
use crate::session::DiagnosisSession;

/// Everything one request produced
#[derive(Debug, Clone)]
pub struct DiagnosisReport {
    pub diagnosis: ConstraintSet,
    pub cache: CacheReport,
    pub telemetry: TelemetrySnapshot,
    pub elapsed_ms: u64,
}

/// Serializable summary of a [`DiagnosisReport`] with named constraints
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub diagnosis: Vec<String>,
    pub cache: CacheReport,
    pub oracle_invocations: u64,
    pub elapsed_ms: u64,
    pub telemetry: TelemetrySnapshot,
}

impl DiagnosisReport {
    /// Summary with constraint names resolved through `name`.
    pub fn summarize<F>(&self, name: F) -> ReportSummary
    where
        F: Fn(paradiag_core::ConstraintId) -> String,
    {
        ReportSummary {
            diagnosis: self.diagnosis.iter().map(name).collect(),
            cache: self.cache.clone(),
            oracle_invocations: self.telemetry.oracle_invocations(),
            elapsed_ms: self.elapsed_ms,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Finds minimal diagnoses with speculative, cached oracle checks
pub struct ParallelDiagnoser<O: Oracle> {
    prototype: O,
    config: DiagnosisConfig,
}

impl<O: Oracle + Sync> ParallelDiagnoser<O> {
    pub fn new(prototype: O, config: DiagnosisConfig) -> Self {
        ParallelDiagnoser {
            prototype,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &DiagnosisConfig {
        &self.config
    }

    pub fn prototype(&self) -> &O {
        &self.prototype
    }

    /// Minimal subset of `c` whose removal makes `b ∪ c` consistent.
    pub fn find_diagnosis(&self, c: &ConstraintSet, b: &ConstraintSet) -> DiagnosisResult<ConstraintSet> {
        self.diagnose(c, b).map(|report| report.diagnosis)
    }

    /// [`ParallelDiagnoser::find_diagnosis`] plus what the request cost.
    pub fn diagnose(&self, c: &ConstraintSet, b: &ConstraintSet) -> DiagnosisResult<DiagnosisReport> {
        let started = Instant::now();
        let telemetry = Telemetry::new();
        let mut session = DiagnosisSession::open(&self.prototype, &self.config, Arc::clone(&telemetry))?;

        let outcome = fastdiag::find_diagnosis(&mut session, c, b, &telemetry);
        let cache = session.shutdown().unwrap_or_default();
        drop(session);

        let diagnosis = outcome.map_err(|e| {
            error!("Diagnosis of {} candidates failed: {}", c.len(), e);
            e
        })?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Diagnosis of {} candidates found {} constraints in {}ms ({} cache entries, {} pruned)",
            c.len(),
            diagnosis.len(),
            elapsed_ms,
            cache.entries,
            cache.pruned
        );
        Ok(DiagnosisReport {
            diagnosis,
            cache,
            telemetry: telemetry.snapshot(),
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paradiag_core::{Catalog, ConflictOracle};

    #[test]
    fn test_report_summary_uses_names() {
        let mut catalog = Catalog::new();
        let oracle = ConflictOracle::new(vec![catalog.set(["a", "b"])]);
        let c = catalog.set(["a", "b", "c"]);
        let diagnoser = ParallelDiagnoser::new(oracle, DiagnosisConfig::default());

        let report = diagnoser.diagnose(&c, &ConstraintSet::empty()).unwrap();
        let summary = report.summarize(|id| catalog.name(id).unwrap_or("?").to_string());
        assert_eq!(summary.diagnosis, vec!["b".to_string()]);
        assert!(summary.oracle_invocations >= 1);
        assert_eq!(summary.cache.pending, 0);
    }

    #[test]
    fn test_config_is_normalized() {
        let oracle = ConflictOracle::new(Vec::new());
        let diagnoser = ParallelDiagnoser::new(oracle, DiagnosisConfig::default().with_check_pool_size(1));
        assert_eq!(diagnoser.config().check_pool_size, DiagnosisConfig::MIN_CHECK_POOL_SIZE);
    }
}
