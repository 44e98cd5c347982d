//! Bounded worker pools backed by a dedicated rayon thread pool.
//!
//! Each diagnosis request owns two of these: a small one running speculative
//! scheduler passes and a larger one running check tasks. Shutdown drains
//! in-flight jobs for a bounded time, then abandons whatever has not started.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use paradiag_core::DiagnosisError;

/// Unit of work accepted by a [`WorkerPool`]
pub trait PoolJob: Send + 'static {
    fn process(self: Box<Self>);

    /// Called instead of `process` when the pool gives up on the job.
    fn abandon(self: Box<Self>) {}
}

#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn leave(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    /// True if the count reached zero before `deadline`.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.drained.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }
}

/// How a [`WorkerPool::shutdown`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Drained,
    /// Timed out; this many jobs were still queued or running
    Forced(usize),
}

pub struct WorkerPool {
    name: &'static str,
    threads: usize,
    pool: rayon::ThreadPool,
    in_flight: Arc<InFlight>,
    accepting: AtomicBool,
    forced: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(name: &'static str, threads: usize) -> Result<Self, DiagnosisError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| format!("paradiag-{}-{}", name, index))
            .panic_handler(move |payload: Box<dyn Any + Send>| {
                error!("Job panicked in {} pool: {}", name, panic_message(payload.as_ref()));
            })
            .build()
            .map_err(|e| DiagnosisError::WorkerPool(format!("Failed to create {} pool: {}", name, e)))?;
        debug!("Started {} pool with {} threads", name, threads);

        Ok(WorkerPool {
            name,
            threads,
            pool,
            in_flight: Arc::new(InFlight::default()),
            accepting: AtomicBool::new(true),
            forced: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Jobs submitted but not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Queues `job`. A pool that is shutting down abandons it immediately.
    pub fn submit(&self, job: Box<dyn PoolJob>) -> Result<(), DiagnosisError> {
        if !self.is_accepting() {
            job.abandon();
            return Err(DiagnosisError::WorkerPool(format!("{} pool is shut down", self.name)));
        }

        self.in_flight.enter();
        let in_flight = Arc::clone(&self.in_flight);
        let forced = Arc::clone(&self.forced);
        self.pool.spawn(move || {
            let _leave = LeaveOnDrop(in_flight);
            if forced.load(Ordering::SeqCst) {
                job.abandon();
            } else {
                job.process();
            }
        });
        Ok(())
    }

    /// Stops accepting work and waits up to `timeout` for in-flight jobs.
    /// On timeout, jobs that have not started yet are abandoned.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.accepting.store(false, Ordering::SeqCst);
        if self.in_flight.wait_until(Instant::now() + timeout) {
            debug!("{} pool drained", self.name);
            return ShutdownOutcome::Drained;
        }

        self.forced.store(true, Ordering::SeqCst);
        let remaining = self.in_flight.current();
        warn!(
            "{} pool did not drain within {:?}; abandoning {} queued or running jobs",
            self.name, timeout, remaining
        );
        ShutdownOutcome::Forced(remaining)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.forced.store(true, Ordering::SeqCst);
    }
}

/// Keeps the in-flight count right even if the job panics.
struct LeaveOnDrop(Arc<InFlight>);

impl Drop for LeaveOnDrop {
    fn drop(&mut self) {
        self.0.leave();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
