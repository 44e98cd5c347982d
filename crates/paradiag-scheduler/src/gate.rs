//! Counting gate bounding how many callers may hold an oracle at once.

use parking_lot::{Condvar, Mutex};

use paradiag_core::DiagnosisError;

#[derive(Debug)]
struct GateState {
    permits: usize,
    closed: bool,
}

/// Counting semaphore with a close operation that wakes every waiter.
#[derive(Debug)]
pub struct Gate {
    state: Mutex<GateState>,
    available: Condvar,
}

impl Gate {
    pub fn new(permits: usize) -> Self {
        Gate {
            state: Mutex::new(GateState {
                permits,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available. Fails once the gate is closed.
    pub fn acquire(&self) -> Result<(), DiagnosisError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(DiagnosisError::PoolClosed);
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            self.available.wait(&mut state);
        }
    }

    /// Takes a permit only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.permits == 0 {
            return false;
        }
        state.permits -= 1;
        true
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Rejects every current and future `acquire`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }
}
