use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Observable state of a [`PauseResumeGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Runnable,
    Paused,
    Cancelled,
}

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    cancelled: bool,
}

impl GateState {
    fn status(&self) -> GateStatus {
        if self.cancelled {
            GateStatus::Cancelled
        } else if self.paused {
            GateStatus::Paused
        } else {
            GateStatus::Runnable
        }
    }
}

/// Cooperative barrier checked before each unit of work starts.
///
/// Pausing never interrupts work already running; it only holds back the
/// next claim. Cancellation releases every waiter and stays set until
/// [`reset`](Self::reset) is called.
#[derive(Debug, Default)]
pub struct PauseResumeGate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl PauseResumeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Clears the pause flag and wakes every waiting thread.
    pub fn resume(&self) {
        self.lock().paused = false;
        self.condvar.notify_all();
    }

    /// Flips between paused and running, returning the new paused flag.
    pub fn toggle(&self) -> bool {
        let paused = {
            let mut state = self.lock();
            state.paused = !state.paused;
            state.paused
        };
        if !paused {
            self.condvar.notify_all();
        }
        paused
    }

    /// Releases all waiters permanently.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.condvar.notify_all();
    }

    /// Clears both flags so the gate can be reused for a new run.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.paused = false;
        state.cancelled = false;
        drop(state);
        self.condvar.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn status(&self) -> GateStatus {
        self.lock().status()
    }

    /// Blocks while paused. Returns `false` if the gate was cancelled.
    pub fn await_runnable(&self) -> bool {
        let mut state = self.lock();
        while state.paused && !state.cancelled {
            state = match self.condvar.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        !state.cancelled
    }

    /// Like [`await_runnable`](Self::await_runnable) but gives up after
    /// `timeout`, so callers can check their own stop conditions.
    pub fn wait_timeout(&self, timeout: Duration) -> GateStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.paused && !state.cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.condvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        state.status()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
