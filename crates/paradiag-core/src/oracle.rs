//! The consistency oracle boundary.
//!
//! An [`Oracle`] answers whether a finite constraint set is jointly
//! satisfiable. Instances are not reentrant (`&mut self`), so concurrent
//! callers each need their own clone; cloning may be expensive and may fail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::constraint::ConstraintSet;
use crate::errors::OracleError;

/// External engine deciding the consistency of a constraint set.
///
/// Consistency is assumed monotone: subsets of a consistent set are
/// consistent, supersets of an inconsistent set are inconsistent.
pub trait Oracle: Send + 'static {
    /// Decide whether `constraints` (already including any background) is consistent.
    fn is_consistent(&mut self, constraints: &ConstraintSet) -> Result<bool, OracleError>;

    /// Produce an independent instance that shares no mutable solver state.
    fn try_clone(&self) -> Result<Self, OracleError>
    where
        Self: Sized;
}

/// Reference oracle: a set is consistent iff it contains none of the declared
/// conflict sets.
///
/// The invocation counter is shared by every clone, so callers can observe how
/// many oracle calls a whole diagnosis performed.
#[derive(Debug)]
pub struct ConflictOracle {
    conflicts: Arc<[ConstraintSet]>,
    latency: Duration,
    invocations: Arc<AtomicU64>,
    clones: Arc<AtomicU64>,
    fail_clones: bool,
    fail_on: Option<ConstraintSet>,
}

impl ConflictOracle {
    pub fn new<I: IntoIterator<Item = ConstraintSet>>(conflicts: I) -> Self {
        ConflictOracle {
            conflicts: conflicts.into_iter().collect::<Vec<_>>().into(),
            latency: Duration::ZERO,
            invocations: Arc::new(AtomicU64::new(0)),
            clones: Arc::new(AtomicU64::new(0)),
            fail_clones: false,
            fail_on: None,
        }
    }

    /// Simulated solving time per check
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every `try_clone` fails
    pub fn failing_clones(mut self) -> Self {
        self.fail_clones = true;
        self
    }

    /// Checks of exactly `set` fail
    pub fn failing_on(mut self, set: ConstraintSet) -> Self {
        self.fail_on = Some(set);
        self
    }

    pub fn conflicts(&self) -> &[ConstraintSet] {
        &self.conflicts
    }

    /// Oracle calls performed by this instance and all of its clones
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Successful clones made from this instance's family
    pub fn clone_count(&self) -> u64 {
        self.clones.load(Ordering::SeqCst)
    }

    /// Shared handle to the invocation counter
    pub fn invocation_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.invocations)
    }

    /// Answer without counting or sleeping; used for expectations in tests.
    pub fn evaluate(&self, constraints: &ConstraintSet) -> bool {
        !self.conflicts.iter().any(|conflict| conflict.is_subset_of(constraints))
    }
}

impl Oracle for ConflictOracle {
    fn is_consistent(&mut self, constraints: &ConstraintSet) -> Result<bool, OracleError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.fail_on.as_ref() == Some(constraints) {
            return Err(OracleError::CheckFailed {
                set: constraints.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let consistent = self.evaluate(constraints);
        trace!("ConflictOracle checked {} -> {}", constraints, consistent);
        Ok(consistent)
    }

    fn try_clone(&self) -> Result<Self, OracleError> {
        if self.fail_clones {
            return Err(OracleError::CloneFailed("injected clone failure".to_string()));
        }
        self.clones.fetch_add(1, Ordering::SeqCst);
        Ok(ConflictOracle {
            conflicts: Arc::clone(&self.conflicts),
            latency: self.latency,
            invocations: Arc::clone(&self.invocations),
            clones: Arc::clone(&self.clones),
            fail_clones: self.fail_clones,
            fail_on: self.fail_on.clone(),
        })
    }
}
