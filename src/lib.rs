//! Parallel FastDiag.
//!
//! Finds a minimal diagnosis (a minimal subset of candidate constraints whose
//! removal restores consistency) while speculatively pre-computing consistency
//! checks the recursion is likely to ask for next.
//!
//! The facade re-exports the workspace crates:
//! - [`core`]: constraint sets, the oracle boundary, configuration, scenarios
//! - [`telemetry`]: counters and timers
//! - [`scheduler`]: oracle pool, result cache, look-ahead and check tasks
//! - [`engine`]: the recursion and the per-request diagnosers

pub use paradiag_core as core;
pub use paradiag_engine as engine;
pub use paradiag_scheduler as scheduler;
pub use paradiag_telemetry as telemetry;

pub use paradiag_core::{
    Catalog, ConflictOracle, ConstraintId, ConstraintSet, DiagnosisConfig, DiagnosisError, DiagnosisResult, Oracle,
    OracleError, Scenario,
};
pub use paradiag_engine::{DiagnosisReport, ParallelDiagnoser, SequentialDiagnoser};
