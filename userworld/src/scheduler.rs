//! Traits for the external collaborators spec §1 lists as out of scope but
//! consumed: a scheduler (wait/wakeup/sleep) and a clock. Real
//! implementations live outside this crate; tests use the `local` module's
//! thread-parking stand-ins.

use std::time::Duration;

use waitcell::WorldId;

/// What caused a `wait()` call to return (spec §4.7 "Cancellation").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WakeReason {
    /// Another world called `wakeup` targeting us.
    Woken,
    /// The timeout elapsed first.
    TimedOut,
    /// The calling world has a pending signal, or is dying (spec §4.7:
    /// "useful interruption").
    Interrupted,
}

/// The scheduler's wait/wakeup primitive (spec §4.7, §9): "atomically
/// releases the passed lock, sleeps, and reacquires on wake". Modeled as a
/// trait rather than a concrete thread-parking type because CPU
/// scheduling is explicitly out of scope (spec §1) — this crate only
/// needs *a* primitive with these semantics, not the specific one a given
/// embedder uses.
pub trait Scheduler: Send + Sync {
    /// The currently-running world's id.
    fn current_world(&self) -> WorldId;

    /// Suspends the current world until woken, timed out, or
    /// interrupted. Unlike the original's lock-release/reacquire
    /// coupling, callers here drop their own lock guards before calling
    /// `wait` and reacquire them afterward — composing that with a
    /// generic trait object without higher-kinded lock types would be
    /// awkward, so the "atomic release+sleep" step is split into "caller
    /// drops the guard, then calls wait", which is race-free here because
    /// registration on the relevant `WaiterList`/`PollCache` happens
    /// *before* the lock is dropped (see `crate::poll` and `crate::pipe`
    /// call sites).
    fn wait(&self, world: WorldId, timeout: Option<Duration>) -> WakeReason;

    /// Wakes a single suspended world (no-op if it isn't waiting).
    fn wakeup(&self, world: WorldId);
}

pub trait Clock: Send + Sync {
    fn now_monotonic(&self) -> Duration;
}

pub mod local {
    //! A simple in-process `Scheduler`/`Clock` pair, condvar-based,
    //! suitable for tests and single-process embedders. Grounded on the
    //! teacher's `sysx::sync::Parker` (one instance per world) rather than
    //! a global run queue.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use sysx::Sema;
    use waitcell::WorldId;

    use super::{Clock, Scheduler, WakeReason};

    #[derive(Default)]
    struct WorldState {
        sema: Arc<Sema>,
        interrupted: bool,
    }

    pub struct LocalScheduler {
        next_id: AtomicU64,
        worlds: Mutex<HashMap<WorldId, WorldState>>,
    }

    impl Default for LocalScheduler {
        fn default() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                worlds: Mutex::new(HashMap::new()),
            }
        }
    }

    impl LocalScheduler {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn new_world(&self) -> WorldId {
            let id = WorldId(self.next_id.fetch_add(1, Ordering::Relaxed));
            self.worlds.lock().insert(id, WorldState::default());
            id
        }

        /// Marks `world` as having a pending signal, so its next `wait`
        /// call returns `Interrupted` instead of blocking to completion
        /// (spec §4.7 "useful interruption").
        pub fn signal(&self, world: WorldId) {
            let mut worlds = self.worlds.lock();
            if let Some(state) = worlds.get_mut(&world) {
                state.interrupted = true;
                state.sema.release();
            }
        }
    }

    impl Scheduler for LocalScheduler {
        fn current_world(&self) -> WorldId {
            // A real embedder would read thread-local storage; tests pass
            // the world id explicitly instead.
            WorldId(0)
        }

        fn wait(&self, world: WorldId, timeout: Option<Duration>) -> WakeReason {
            let sema = {
                let mut worlds = self.worlds.lock();
                let state = worlds.entry(world).or_default();
                if state.interrupted {
                    state.interrupted = false;
                    return WakeReason::Interrupted;
                }
                state.sema.clone()
            };

            let woke = match timeout {
                Some(d) => sema.acquire_timeout(d),
                None => {
                    sema.acquire();
                    true
                }
            };

            if !woke {
                return WakeReason::TimedOut;
            }

            let mut worlds = self.worlds.lock();
            let state = worlds.entry(world).or_default();
            if state.interrupted {
                state.interrupted = false;
                WakeReason::Interrupted
            } else {
                WakeReason::Woken
            }
        }

        fn wakeup(&self, world: WorldId) {
            let mut worlds = self.worlds.lock();
            let state = worlds.entry(world).or_default();
            state.sema.release();
        }
    }

    pub struct MonotonicClock {
        start: Instant,
    }

    impl Default for MonotonicClock {
        fn default() -> Self {
            Self {
                start: Instant::now(),
            }
        }
    }

    impl Clock for MonotonicClock {
        fn now_monotonic(&self) -> Duration {
            self.start.elapsed()
        }
    }
}
