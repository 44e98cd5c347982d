// ORACLE POOL
//
// Oracle instances are not reentrant, so every concurrent check needs its own
// clone. The pool clones the prototype 2 x pool_size times up front and gates
// usage with pool_size permits; the spare handles keep the free-handle scan
// short under contention.
//
// SAFETY INVARIANTS:
// 1. At most pool_size handles are in use at any instant
// 2. A handle is claimed only under the pool-wide claim lock
// 3. Every granted lease gives its permit back exactly once (on release or drop)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, error};

use paradiag_core::{ConstraintSet, DiagnosisError, Oracle, OracleError};
use paradiag_telemetry::{counters, timers, Telemetry};

use crate::gate::Gate;

/// One cloned oracle plus its in-use flag
#[derive(Debug)]
pub struct OracleHandle<O> {
    id: usize,
    oracle: Mutex<O>,
    in_use: AtomicBool,
}

impl<O> OracleHandle<O> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// Fixed set of oracle clones shared by check tasks
#[derive(Debug)]
pub struct OraclePool<O> {
    handles: Vec<OracleHandle<O>>,
    gate: Gate,
    claim: Mutex<()>,
    pool_size: usize,
    telemetry: Arc<Telemetry>,
}

impl<O: Oracle + Sync> OraclePool<O> {
    /// Clones `prototype` `2 x pool_size` times in parallel. Any clone failure
    /// aborts construction.
    pub fn new(pool_size: usize, prototype: &O, telemetry: Arc<Telemetry>) -> Result<Self, DiagnosisError> {
        let pool_size = pool_size.max(1);
        let clones = (0..pool_size * 2)
            .into_par_iter()
            .map(|_| prototype.try_clone())
            .collect::<Result<Vec<O>, OracleError>>()
            .map_err(|e| {
                error!("Oracle pool construction failed: {}", e);
                DiagnosisError::from(e)
            })?;

        let handles = clones
            .into_iter()
            .enumerate()
            .map(|(id, oracle)| OracleHandle {
                id,
                oracle: Mutex::new(oracle),
                in_use: AtomicBool::new(false),
            })
            .collect::<Vec<_>>();
        debug!("Oracle pool ready: {} handles, {} permits", handles.len(), pool_size);

        Ok(OraclePool {
            handles,
            gate: Gate::new(pool_size),
            claim: Mutex::new(()),
            pool_size,
            telemetry,
        })
    }
}

impl<O: Oracle> OraclePool<O> {
    /// Blocks on the gate, then claims a free handle.
    pub fn acquire(&self) -> Result<OracleLease<'_, O>, DiagnosisError> {
        {
            let _wait = self.telemetry.start(timers::GATE_WAIT);
            self.gate.acquire()?;
        }

        let claimed = {
            let _claim = self.claim.lock();
            let free = self.handles.iter().find(|handle| !handle.is_in_use());
            if let Some(handle) = free {
                handle.in_use.store(true, Ordering::SeqCst);
            }
            free
        };

        match claimed {
            Some(handle) => {
                self.telemetry.incr(counters::HANDLES_ACQUIRED);
                debug!("Acquired oracle handle {}", handle.id);
                Ok(OracleLease {
                    pool: self,
                    handle,
                    released: false,
                })
            }
            None => {
                error!(
                    "No free oracle handle despite a granted permit ({} of {} in use)",
                    self.in_use_count(),
                    self.handles.len()
                );
                self.gate.release();
                Err(DiagnosisError::NoFreeHandle)
            }
        }
    }

    fn release_handle(&self, handle: &OracleHandle<O>) {
        handle.in_use.store(false, Ordering::SeqCst);
        self.gate.release();
        debug!("Released oracle handle {}", handle.id);
    }

    /// Explicit release; equivalent to dropping the lease.
    pub fn release(&self, lease: OracleLease<'_, O>) {
        lease.release();
    }

    /// Wakes blocked acquirers with [`DiagnosisError::PoolClosed`].
    pub fn close(&self) {
        self.gate.close();
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of oracle clones held
    pub fn capacity(&self) -> usize {
        self.handles.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.handles.iter().filter(|handle| handle.is_in_use()).count()
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.in_use_count()
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }
}

/// Exclusive use of one oracle handle. Dropping the lease releases it.
pub struct OracleLease<'a, O: Oracle> {
    pool: &'a OraclePool<O>,
    handle: &'a OracleHandle<O>,
    released: bool,
}

impl<O: Oracle> OracleLease<'_, O> {
    pub fn handle_id(&self) -> usize {
        self.handle.id
    }

    pub fn check(&mut self, constraints: &ConstraintSet) -> Result<bool, OracleError> {
        let _timer = self.pool.telemetry.start(timers::ORACLE);
        self.handle.oracle.lock().is_consistent(constraints)
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_handle(self.handle);
        }
    }
}

impl<O: Oracle> Drop for OracleLease<'_, O> {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paradiag_core::{Catalog, ConflictOracle};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn pool(size: usize) -> Arc<OraclePool<ConflictOracle>> {
        Arc::new(OraclePool::new(size, &ConflictOracle::new(Vec::new()), Telemetry::new()).unwrap())
    }

    #[test]
    fn test_pool_clones_twice_the_pool_size() {
        let prototype = ConflictOracle::new(Vec::new());
        let pool = OraclePool::new(3, &prototype, Telemetry::new()).unwrap();
        assert_eq!(pool.capacity(), 6);
        assert_eq!(prototype.clone_count(), 6);
        assert_eq!(pool.available_permits(), 3);
        assert_eq!(pool.free_count(), 6);
    }

    #[test]
    fn test_clone_failure_aborts_construction() {
        let prototype = ConflictOracle::new(Vec::new()).failing_clones();
        let result = OraclePool::new(2, &prototype, Telemetry::new());
        assert!(matches!(result, Err(DiagnosisError::Oracle(OracleError::CloneFailed(_)))));
    }

    #[test]
    fn test_lease_checks_and_releases_on_drop() {
        let mut catalog = Catalog::new();
        let conflict = catalog.set(["a"]);
        let pool = OraclePool::new(1, &ConflictOracle::new(vec![conflict.clone()]), Telemetry::new()).unwrap();
        {
            let mut lease = pool.acquire().unwrap();
            assert!(!lease.check(&conflict).unwrap());
            assert_eq!(pool.in_use_count(), 1);
            assert_eq!(pool.available_permits(), 0);
        }
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.available_permits(), 1);

        let lease = pool.acquire().unwrap();
        pool.release(lease);
        assert_eq!(pool.available_permits(), 1);
    }

    #[test]
    fn test_extra_acquire_blocks_until_release() {
        let pool = pool(2);
        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pool = Arc::clone(&pool);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let lease = pool.acquire().unwrap();
                acquired.store(true, Ordering::SeqCst);
                drop(lease);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(first);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_fails_blocked_acquire() {
        let pool = pool(1);
        let lease = pool.acquire().unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(DiagnosisError::PoolClosed)));
        drop(lease);
    }

    #[test]
    fn test_concurrent_cycles_never_oversubscribe() {
        let pool = pool(3);
        let peak = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let lease = pool.acquire().unwrap();
                        peak.fetch_max(pool.in_use_count(), Ordering::SeqCst);
                        drop(lease);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.free_count(), pool.capacity());
        assert_eq!(pool.available_permits(), 3);
    }
}
