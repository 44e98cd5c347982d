// === Recursion ===
pub mod fastdiag;

// === Request Lifecycle ===
pub mod session;
pub mod diagnoser;

// === Baseline ===
pub mod sequential;

pub use diagnoser::{DiagnosisReport, ParallelDiagnoser, ReportSummary};
pub use fastdiag::{find_diagnosis, ConsistencyChecker};
pub use sequential::SequentialDiagnoser;
pub use session::DiagnosisSession;
