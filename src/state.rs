//! Lifecycle states of the emulation worker.
//!
//! The states form a total order so that lifecycle queries can use range
//! comparisons: "started" is anything past `Initialized`, "active" is the
//! band from `Running` up to (but excluding) `Exiting`, "exited" is anything
//! past `Exiting`. `Crashed` sits above `Shutdown` so the teardown path,
//! which only promotes states below `Shutdown`, never erases a crash verdict.

use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadState {
    Initialized,
    Running,
    Reseting,
    Interrupting,
    Interrupted,
    Pausing,
    Paused,
    Exiting,
    Shutdown,
    Crashed,
}

impl ThreadState {
    #[inline]
    pub fn has_started(self) -> bool {
        self > ThreadState::Initialized
    }

    #[inline]
    pub fn is_active(self) -> bool {
        ThreadState::Running <= self && self < ThreadState::Exiting
    }

    #[inline]
    pub fn has_exited(self) -> bool {
        self > ThreadState::Exiting
    }
}

/// Mutable lifecycle data, always accessed with the state mutex held.
pub(crate) struct StateData {
    pub state: ThreadState,
    /// State to restore when the outermost interrupt is released.
    pub saved_state: ThreadState,
    /// Count of outstanding interrupt requests. Only the outermost pair
    /// flips `state`; this is a logical recursion count, not an OS mutex.
    pub interrupt_depth: u32,
}

/// The state mutex and its condition variable.
pub(crate) struct StateChannel {
    data: Mutex<StateData>,
    cond: Condvar,
}

impl StateChannel {
    pub fn new() -> StateChannel {
        StateChannel {
            data: Mutex::new(StateData {
                state: ThreadState::Initialized,
                saved_state: ThreadState::Initialized,
                interrupt_depth: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StateData> {
        self.data.lock().unwrap()
    }

    pub fn wake(&self) {
        self.cond.notify_all();
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, StateData>) -> MutexGuard<'a, StateData> {
        self.cond.wait(guard).unwrap()
    }

    pub fn state(&self) -> ThreadState {
        self.lock().state
    }

    pub fn change_state(&self, new_state: ThreadState, broadcast: bool) {
        let mut data = self.lock();
        data.state = new_state;
        if broadcast {
            self.cond.notify_all();
        }
    }

    /// Wait out an in-flight interrupt so the interrupting thread gets its
    /// quiesced worker back before the caller's request takes effect.
    pub fn wait_on_interrupt<'a>(
        &self,
        mut data: MutexGuard<'a, StateData>,
    ) -> MutexGuard<'a, StateData> {
        while data.state == ThreadState::Interrupted {
            data = self.wait(data);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_total_order() {
        use ThreadState::*;
        assert!(Initialized < Running);
        for s in &[Reseting, Interrupting, Interrupted, Pausing, Paused] {
            assert!(Running < *s);
            assert!(*s < Exiting);
        }
        assert!(Exiting < Shutdown);
        assert!(Crashed > Exiting);
        assert!(Crashed > Shutdown);
    }

    #[test]
    fn test_range_predicates() {
        use ThreadState::*;
        assert!(!Initialized.has_started());
        assert!(Running.has_started());
        assert!(Shutdown.has_started());

        assert!(!Initialized.is_active());
        assert!(Running.is_active());
        assert!(Paused.is_active());
        assert!(Interrupted.is_active());
        assert!(!Exiting.is_active());
        assert!(!Crashed.is_active());

        assert!(!Exiting.has_exited());
        assert!(Shutdown.has_exited());
        assert!(Crashed.has_exited());
    }
}
