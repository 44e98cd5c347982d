// === Constraint Model ===
pub mod constraint;

// === Oracle Boundary ===
pub mod oracle;

// === Configuration, Scenarios and Errors ===
pub mod config;
pub mod errors;
pub mod scenario;

// === Re-exports for the rest of the workspace ===
pub use constraint::{Catalog, ConstraintId, ConstraintSet, Fingerprint};
pub use oracle::{ConflictOracle, Oracle};
pub use config::DiagnosisConfig;
pub use errors::{DiagnosisError, OracleError};
pub use scenario::{CompiledScenario, Scenario};

/// Result alias used across the workspace
pub type DiagnosisResult<T> = Result<T, DiagnosisError>;
