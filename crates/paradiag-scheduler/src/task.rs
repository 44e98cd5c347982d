// CHECK TASKS
//
// A check task asks the oracle pool about one constraint set and writes the
// answer into that set's cache entry, then prunes pending entries the answer
// decides by monotonicity.
//
// STATE MACHINE:
//   Queued -> Running -> Done | Failed
//   Queued -> Cancelled
// Cancellation is start-only: a Running task is never interrupted.
//
// LOCK ORDER: oracle permit, then the entry's compute lock. A pooled task
// never holds the compute lock while waiting at the gate, so a direct check
// of the same entry only ever waits on an oracle call already in progress.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use paradiag_core::{ConstraintSet, DiagnosisError, Oracle};
use paradiag_telemetry::{counters, timers, Telemetry};

use crate::oracle_pool::OraclePool;
use crate::result_cache::{ResultCache, ResultEntry, Resolution};
use crate::worker_pool::PoolJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Running = 1,
    Done = 2,
    Cancelled = 3,
    Failed = 4,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Done,
            3 => TaskState::Cancelled,
            _ => TaskState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Shared view of a task's lifecycle, held by the task and by its cache entry.
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    state: AtomicU8,
    failure: Mutex<Option<String>>,
}

impl TaskHandle {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(TaskHandle {
            id,
            state: AtomicU8::new(TaskState::Queued as u8),
            failure: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Queued -> Running. False if the task was cancelled first.
    pub fn try_start(&self) -> bool {
        self.transition(TaskState::Queued, TaskState::Running)
    }

    /// Queued -> Cancelled. Started or finished tasks are left untouched.
    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Queued, TaskState::Cancelled)
    }

    pub fn finish(&self) {
        self.transition(TaskState::Running, TaskState::Done);
    }

    pub fn fail(&self, reason: String) {
        *self.failure.lock() = Some(reason);
        self.state.store(TaskState::Failed as u8, Ordering::SeqCst);
    }

    /// Queued or Running
    pub fn is_live(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

/// Everything a check needs besides the set itself
pub struct CheckContext<O: Oracle> {
    pub pool: Arc<OraclePool<O>>,
    pub cache: Arc<ResultCache>,
    pub telemetry: Arc<Telemetry>,
}

impl<O: Oracle> Clone for CheckContext<O> {
    fn clone(&self) -> Self {
        CheckContext {
            pool: Arc::clone(&self.pool),
            cache: Arc::clone(&self.cache),
            telemetry: Arc::clone(&self.telemetry),
        }
    }
}

/// One pooled oracle query for one cache entry
pub struct CheckTask<O: Oracle> {
    entry: Arc<ResultEntry>,
    handle: Arc<TaskHandle>,
    context: CheckContext<O>,
}

impl<O: Oracle> CheckTask<O> {
    /// Creates the task and registers it as the entry's owner.
    pub fn new(entry: Arc<ResultEntry>, context: CheckContext<O>) -> Self {
        let handle = TaskHandle::new(context.cache.next_task_id());
        entry.attach(Arc::clone(&handle));
        context.telemetry.incr(counters::CHECK_TASKS_CREATED);
        CheckTask { entry, handle, context }
    }

    pub fn handle(&self) -> Arc<TaskHandle> {
        Arc::clone(&self.handle)
    }

    pub fn set(&self) -> &ConstraintSet {
        self.entry.set()
    }

    /// Runs the check on the current thread and returns the entry's outcome.
    pub fn run(self) -> Result<bool, DiagnosisError> {
        if !self.handle.try_start() {
            self.context.telemetry.incr(counters::CHECK_TASKS_CANCELLED);
            trace!("Check task {} for {} cancelled before start", self.handle.id(), self.entry.set());
            return self
                .entry
                .consistency()
                .ok_or_else(|| DiagnosisError::Cancelled(self.entry.set().to_string()));
        }

        match self.execute() {
            Ok(consistent) => {
                self.handle.finish();
                Ok(consistent)
            }
            Err(e) => {
                self.handle.fail(e.to_string());
                self.entry.record_failure(e.to_string());
                Err(e)
            }
        }
    }

    fn execute(&self) -> Result<bool, DiagnosisError> {
        if let Some(consistent) = self.skip_if_resolved() {
            return Ok(consistent);
        }

        let mut lease = self.context.pool.acquire()?;
        let guard = self.entry.lock_compute();
        if let Some(consistent) = self.skip_if_resolved() {
            return Ok(consistent);
        }

        let consistent = lease.check(self.entry.set())?;
        lease.release();
        self.context.telemetry.incr(counters::WORKER_CHECKS);
        self.entry.complete(consistent, Resolution::Oracle);
        drop(guard);

        debug!("Check task {} resolved {} -> {}", self.handle.id(), self.entry.set(), consistent);
        self.context.cache.cleanup(self.entry.set(), consistent);
        Ok(consistent)
    }

    fn skip_if_resolved(&self) -> Option<bool> {
        let consistent = self.entry.consistency()?;
        self.context.telemetry.incr(counters::CHECK_TASKS_SKIPPED);
        trace!("Check task {} skipped, {} already resolved", self.handle.id(), self.entry.set());
        Some(consistent)
    }
}

impl<O: Oracle> PoolJob for CheckTask<O> {
    fn process(self: Box<Self>) {
        let set = self.entry.set().clone();
        let telemetry = Arc::clone(&self.context.telemetry);
        match CheckTask::run(*self) {
            Ok(_) | Err(DiagnosisError::Cancelled(_)) => {}
            Err(e) => {
                telemetry.incr(counters::SPECULATIVE_FAILURES);
                warn!("Speculative check of {} failed: {}", set, e);
            }
        }
    }

    fn abandon(self: Box<Self>) {
        if self.handle.cancel() {
            self.context.telemetry.incr(counters::CHECK_TASKS_CANCELLED);
            trace!("Check task {} abandoned by a closing pool", self.handle.id());
        }
    }
}

/// Runs the check for `entry` on the caller's own oracle, outside the pool.
///
/// Used by the driver so that its synchronous path never waits on a pool
/// permit held by speculative work. Exactly-once still holds: the entry's
/// compute lock is shared with pooled tasks.
pub fn run_direct<O: Oracle>(
    entry: &Arc<ResultEntry>,
    oracle: &mut O,
    cache: &ResultCache,
    telemetry: &Telemetry,
) -> Result<bool, DiagnosisError> {
    let handle = TaskHandle::new(cache.next_task_id());
    entry.attach(Arc::clone(&handle));
    if !handle.try_start() {
        return Err(DiagnosisError::Cancelled(entry.set().to_string()));
    }

    let guard = entry.lock_compute();
    if let Some(consistent) = entry.consistency() {
        handle.finish();
        return Ok(consistent);
    }

    let consistent = {
        let _timer = telemetry.start(timers::ORACLE);
        oracle.is_consistent(entry.set())
    };
    let consistent = match consistent {
        Ok(consistent) => consistent,
        Err(e) => {
            let err = DiagnosisError::from(e);
            handle.fail(err.to_string());
            entry.record_failure(err.to_string());
            return Err(err);
        }
    };
    telemetry.incr(counters::DRIVER_CHECKS);
    entry.complete(consistent, Resolution::Oracle);
    drop(guard);
    handle.finish();

    cache.cleanup(entry.set(), consistent);
    Ok(consistent)
}
