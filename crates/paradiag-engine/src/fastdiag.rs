//! The FastDiag recursion.
//!
//! Computes a maximal satisfiable subset (MSS) of C given background B by
//! divide and conquer, and returns the diagnosis as `C \ MSS`. The recursion
//! only ever asks one question, "is B ∪ C consistent", through a
//! [`ConsistencyChecker`]; the checker also receives the pending split
//! remainders Δ so that it can speculate on what comes next.

use tracing::{debug, trace};

use paradiag_core::{ConstraintSet, DiagnosisResult};
use paradiag_telemetry::{counters, timers, Telemetry};

/// Answers consistency questions for the recursion
pub trait ConsistencyChecker {
    /// Whether `b ∪ c` is consistent. `delta` lists the remainders the
    /// recursion still has to process, most urgent first.
    fn is_consistent(&mut self, c: &ConstraintSet, b: &ConstraintSet, delta: &[ConstraintSet]) -> DiagnosisResult<bool>;
}

/// Minimal diagnosis of `c` with respect to background `b`.
///
/// Empty when `c` is empty or `b ∪ c` is already consistent.
pub fn find_diagnosis<K: ConsistencyChecker>(
    checker: &mut K,
    c: &ConstraintSet,
    b: &ConstraintSet,
    telemetry: &Telemetry,
) -> DiagnosisResult<ConstraintSet> {
    debug!("Identifying diagnosis for C={} B={}", c, b);
    if c.is_empty() || checker.is_consistent(c, b, &[])? {
        debug!("No diagnosis needed");
        return Ok(ConstraintSet::empty());
    }

    let _timer = telemetry.start(timers::DIAGNOSIS);
    telemetry.incr(counters::DIAGNOSIS_CALLS);
    let mss = fd(checker, &ConstraintSet::empty(), c, b, telemetry)?;
    let diagnosis = c.difference(&mss);
    debug!("Found diagnosis {}", diagnosis);
    Ok(diagnosis)
}

/// MSS of `c` given `b`; `delta` is the sibling half still to be tried.
fn fd<K: ConsistencyChecker>(
    checker: &mut K,
    delta: &ConstraintSet,
    c: &ConstraintSet,
    b: &ConstraintSet,
    telemetry: &Telemetry,
) -> DiagnosisResult<ConstraintSet> {
    trace!("fd(Δ={}, C={}, B={})", delta, c, b);
    if !delta.is_empty() && checker.is_consistent(c, b, std::slice::from_ref(delta))? {
        return Ok(c.clone());
    }

    let Some((c1, c2)) = c.split() else {
        return Ok(ConstraintSet::empty());
    };

    telemetry.incr(counters::DIAGNOSIS_CALLS);
    let delta1 = fd(checker, &c2, &c1, b, telemetry)?;

    telemetry.incr(counters::DIAGNOSIS_CALLS);
    let delta2 = fd(checker, &c1.difference(&delta1), &c2, &b.union(&delta1), telemetry)?;

    Ok(delta1.union(&delta2))
}
