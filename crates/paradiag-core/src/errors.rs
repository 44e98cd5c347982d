use thiserror::Error;

/// Errors raised by an oracle implementation
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle clone failed: {0}")]
    CloneFailed(String),
    #[error("Oracle check failed for {set}: {reason}")]
    CheckFailed { set: String, reason: String },
}

/// Errors surfaced by a diagnosis request
#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("Oracle pool closed while waiting for a handle")]
    PoolClosed,
    #[error("No free oracle handle despite a granted permit")]
    NoFreeHandle,
    #[error("Check task for {0} was cancelled")]
    Cancelled(String),
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Unknown constraint: {0}")]
    UnknownConstraint(String),
    #[error("Scenario error: {0}")]
    Scenario(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiagnosisError {
    /// Whether the error should abort the whole diagnosis request
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DiagnosisError::Cancelled(_))
    }
}
