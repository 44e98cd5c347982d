//! Diagnosis configuration.
//!
//! Loaded from an optional file plus `PARADIAG_*` environment variables via
//! the `config` crate. Every field has a default, so an empty source is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::DiagnosisError;

/// Environment variable prefix, e.g. `PARADIAG_CHECK_POOL_SIZE=8`
pub const ENV_PREFIX: &str = "PARADIAG";

/// Tunables for one `find_diagnosis` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    /// Threads running speculative look-ahead
    pub scheduler_pool_size: usize,
    /// Threads running check tasks; also the number of concurrent oracle calls
    pub check_pool_size: usize,
    /// Depth bound of the speculative look-ahead
    pub max_level: usize,
    /// Bounded wait on a pending cache entry before computing directly
    pub resolve_wait_ms: u64,
    /// Near-frontier slack: speculative checks are dispatched only for sets
    /// at most this much smaller than the query being answered
    pub frontier_slack: usize,
    /// Graceful drain period of each worker pool at teardown
    pub drain_timeout_ms: u64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        DiagnosisConfig {
            scheduler_pool_size: 1,
            check_pool_size: Self::MIN_CHECK_POOL_SIZE,
            max_level: 1,
            resolve_wait_ms: 5,
            frontier_slack: 2,
            drain_timeout_ms: 1000,
        }
    }
}

impl DiagnosisConfig {
    pub const MIN_SCHEDULER_POOL_SIZE: usize = 1;
    pub const MIN_CHECK_POOL_SIZE: usize = 4;
    pub const MIN_MAX_LEVEL: usize = 1;

    /// Load from `path` (if given) layered under `PARADIAG_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, DiagnosisError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let loaded: DiagnosisConfig = settings.try_deserialize()?;
        Ok(loaded.normalized())
    }

    /// Clamp values below their minimums, warning about each one.
    pub fn normalized(mut self) -> Self {
        if self.scheduler_pool_size < Self::MIN_SCHEDULER_POOL_SIZE {
            warn!(
                "scheduler_pool_size {} raised to {}",
                self.scheduler_pool_size,
                Self::MIN_SCHEDULER_POOL_SIZE
            );
            self.scheduler_pool_size = Self::MIN_SCHEDULER_POOL_SIZE;
        }
        if self.check_pool_size < Self::MIN_CHECK_POOL_SIZE {
            warn!(
                "check_pool_size {} raised to {}",
                self.check_pool_size,
                Self::MIN_CHECK_POOL_SIZE
            );
            self.check_pool_size = Self::MIN_CHECK_POOL_SIZE;
        }
        if self.max_level < Self::MIN_MAX_LEVEL {
            warn!("max_level {} raised to {}", self.max_level, Self::MIN_MAX_LEVEL);
            self.max_level = Self::MIN_MAX_LEVEL;
        }
        self
    }

    pub fn with_scheduler_pool_size(mut self, size: usize) -> Self {
        self.scheduler_pool_size = size;
        self
    }

    pub fn with_check_pool_size(mut self, size: usize) -> Self {
        self.check_pool_size = size;
        self
    }

    pub fn with_max_level(mut self, level: usize) -> Self {
        self.max_level = level;
        self
    }

    pub fn with_resolve_wait(mut self, wait: Duration) -> Self {
        self.resolve_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_frontier_slack(mut self, slack: usize) -> Self {
        self.frontier_slack = slack;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn resolve_wait(&self) -> Duration {
        Duration::from_millis(self.resolve_wait_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
