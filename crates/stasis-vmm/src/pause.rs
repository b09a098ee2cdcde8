//! The pause/acquire quiescence contract.
//!
//! Every device (and, in a richer form, every vCPU — see [`crate::vcpu`])
//! carries a [`PauseState`]. Units of work take *shared* access for their
//! duration with [`acquire`](PauseState::acquire)/[`release`](PauseState::release);
//! a pauser takes *exclusive* access with [`pause`](PauseState::pause), which
//! blocks until every outstanding shared holder has finished. Because one
//! I/O operation holds shared access for exactly its own duration, a
//! returned `pause()` call is a guarantee that the device has no operation
//! in flight and its state may be read or mutated externally.
//!
//! # Manual and automatic pauses
//!
//! Two kinds of pause compose on the same state:
//!
//! - **Manual** (`manual = true`): an operator- or debugger-initiated pause.
//!   At most one may be outstanding; a second returns
//!   [`PauseError::AlreadyPaused`].
//! - **Automatic** (`manual = false`): counted. Snapshot and serialization
//!   paths use these, and several may nest from independent callers.
//!
//! The unit is quiescent exactly while `manual || auto > 0`. Exclusive
//! access is taken once on the transition into that condition and given
//! back once on the transition out of it, regardless of the order in which
//! the manual flag and the automatic count are released.

use std::sync::{Condvar, Mutex};

use thiserror::Error;

/// Misuse of the pause protocol. These indicate a caller bug and are never
/// silently absorbed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PauseError {
    /// A second manual pause arrived before the matching unpause.
    #[error("already paused")]
    AlreadyPaused,

    /// An unpause arrived with no matching pause outstanding.
    #[error("not paused")]
    NotPaused,
}

#[derive(Debug, Default)]
struct PauseFlags {
    /// Manual (operator/debugger) pause flag.
    manual: bool,
    /// Nested automatic pause count.
    auto: usize,
    /// Outstanding shared (`acquire`) holders.
    active: usize,
}

impl PauseFlags {
    fn quiescent_requested(&self) -> bool {
        self.manual || self.auto > 0
    }
}

/// Pause bookkeeping for one device.
///
/// Internally a mutex/condvar pair rather than a reader-writer lock: the
/// exclusive hold must survive across `pause()`/`unpause()` call pairs from
/// different threads, which guard-based locks cannot express.
#[derive(Debug, Default)]
pub struct PauseState {
    flags: Mutex<PauseFlags>,
    /// Signalled when `active` drops to zero.
    idle: Condvar,
    /// Signalled when the quiescence requirement clears.
    resumed: Condvar,
}

impl PauseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take shared access for one unit of work.
    ///
    /// Blocks while any pause is outstanding. Must be balanced by exactly
    /// one [`release`](Self::release).
    pub fn acquire(&self) {
        let mut flags = self.flags.lock().expect("pause state poisoned");
        while flags.quiescent_requested() {
            flags = self.resumed.wait(flags).expect("pause state poisoned");
        }
        flags.active += 1;
    }

    /// Give back shared access taken by [`acquire`](Self::acquire).
    pub fn release(&self) {
        let mut flags = self.flags.lock().expect("pause state poisoned");
        debug_assert!(flags.active > 0, "release without acquire");
        flags.active -= 1;
        if flags.active == 0 {
            self.idle.notify_all();
        }
    }

    /// Request quiescence and block until it holds.
    ///
    /// On return, no shared holder is active and none can start until the
    /// matching [`unpause`](Self::unpause). If the state is already
    /// quiescent (another pause is outstanding), this only records the
    /// additional request and returns immediately.
    pub fn pause(&self, manual: bool) -> Result<(), PauseError> {
        let mut flags = self.flags.lock().expect("pause state poisoned");
        let already_quiescent = flags.quiescent_requested();

        if manual {
            if flags.manual {
                return Err(PauseError::AlreadyPaused);
            }
            flags.manual = true;
        } else {
            flags.auto += 1;
        }

        if already_quiescent {
            // The exclusive hold is already in place.
            return Ok(());
        }

        while flags.active > 0 {
            flags = self.idle.wait(flags).expect("pause state poisoned");
        }
        Ok(())
    }

    /// Drop one pause request; wakes shared waiters only when the last
    /// outstanding request (manual or automatic) is gone.
    pub fn unpause(&self, manual: bool) -> Result<(), PauseError> {
        let mut flags = self.flags.lock().expect("pause state poisoned");

        if manual {
            if !flags.manual {
                return Err(PauseError::NotPaused);
            }
            flags.manual = false;
        } else {
            if flags.auto == 0 {
                return Err(PauseError::NotPaused);
            }
            flags.auto -= 1;
        }

        if !flags.quiescent_requested() {
            self.resumed.notify_all();
        }
        Ok(())
    }

    /// Whether a pause request is currently outstanding.
    pub fn paused(&self) -> bool {
        self.flags
            .lock()
            .expect("pause state poisoned")
            .quiescent_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn double_manual_pause_rejected() {
        let state = PauseState::new();
        state.pause(true).unwrap();
        assert_eq!(state.pause(true), Err(PauseError::AlreadyPaused));
        state.unpause(true).unwrap();
        assert!(!state.paused());
    }

    #[test]
    fn unpause_without_pause_rejected() {
        let state = PauseState::new();
        assert_eq!(state.unpause(true), Err(PauseError::NotPaused));
        assert_eq!(state.unpause(false), Err(PauseError::NotPaused));
    }

    #[test]
    fn auto_pauses_nest() {
        let state = PauseState::new();
        state.pause(false).unwrap();
        state.pause(false).unwrap();
        state.pause(false).unwrap();
        assert!(state.paused());
        state.unpause(false).unwrap();
        state.unpause(false).unwrap();
        assert!(state.paused());
        state.unpause(false).unwrap();
        assert!(!state.paused());
    }

    #[test]
    fn manual_and_auto_release_in_any_order() {
        // Running only after the last release, regardless of order.
        let orders: [[bool; 3]; 3] = [
            [true, false, false],
            [false, true, false],
            [false, false, true],
        ];
        for order in orders {
            let state = PauseState::new();
            state.pause(false).unwrap();
            state.pause(true).unwrap();
            state.pause(false).unwrap();
            for (i, &manual) in order.iter().enumerate() {
                assert!(state.paused(), "order {order:?}: paused before release {i}");
                state.unpause(manual).unwrap();
            }
            assert!(!state.paused(), "order {order:?}: still paused at end");
        }
    }

    #[test]
    fn pause_waits_for_active_holder() {
        let state = Arc::new(PauseState::new());
        state.acquire();

        let pauser = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.pause(true))
        };

        // The pauser cannot complete while we hold shared access.
        thread::sleep(Duration::from_millis(50));
        assert!(!pauser.is_finished());

        state.release();
        pauser.join().unwrap().unwrap();
        state.unpause(true).unwrap();
    }

    #[test]
    fn acquire_blocks_until_last_unpause() {
        let state = Arc::new(PauseState::new());
        // K auto pauses plus one manual, all outstanding.
        state.pause(false).unwrap();
        state.pause(false).unwrap();
        state.pause(true).unwrap();

        let entered = Arc::new(AtomicUsize::new(0));
        let worker = {
            let state = Arc::clone(&state);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                state.acquire();
                entered.store(1, Ordering::SeqCst);
                state.release();
            })
        };

        state.unpause(false).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(entered.load(Ordering::SeqCst), 0, "released after 1 of 3");

        state.unpause(true).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(entered.load(Ordering::SeqCst), 0, "released after 2 of 3");

        state.unpause(false).unwrap();
        worker.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_pauser_returns_without_waiting_for_unpause() {
        // A second (automatic) pause while already quiescent must not block
        // even though the first pause is still outstanding.
        let state = PauseState::new();
        state.pause(true).unwrap();
        state.pause(false).unwrap();
        state.unpause(true).unwrap();
        state.unpause(false).unwrap();
        assert!(!state.paused());
    }

    #[test]
    fn concurrent_readers_and_pausers() {
        let state = Arc::new(PauseState::new());
        let ops = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                let ops = Arc::clone(&ops);
                thread::spawn(move || {
                    for _ in 0..200 {
                        state.acquire();
                        ops.fetch_add(1, Ordering::SeqCst);
                        state.release();
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            state.pause(false).unwrap();
            // Quiescent: reader count must not move while paused.
            let before = ops.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            assert_eq!(ops.load(Ordering::SeqCst), before);
            state.unpause(false).unwrap();
        }

        for r in readers {
            r.join().unwrap();
        }
    }
}
