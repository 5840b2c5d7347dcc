//! A plain counting semaphore plus the binary-semaphore specialisation used
//! to guard an object's reads/writes/close section.
//!
//! Callers that need to wait on a condition owned by the same object they
//! hold this lock for (pipe reads/writes, poll-cache waits) call
//! [`BinarySema::unlock`] themselves before sleeping and [`BinarySema::lock`]
//! again on wake, rather than this type coupling release-and-sleep into one
//! call.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore built on `parking_lot`, in the style of the
/// teacher's `Parker` (`cfgenius`-gated dispatch-semaphore on Darwin,
/// `Mutex`+`Condvar` fallback elsewhere): this project always takes the
/// fallback path since the object subsystem has no dependency on a specific
/// platform wait primitive.
#[derive(Debug)]
pub struct Sema {
    state: Mutex<isize>,
    condvar: Condvar,
}

impl Default for Sema {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Sema {
    pub fn new(initial: isize) -> Self {
        Self {
            state: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn acquire(&self) {
        let mut count = self.state.lock();
        while *count <= 0 {
            self.condvar.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`Self::acquire`] but gives up after `timeout`, returning
    /// `false` on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while *count <= 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let result = self.condvar.wait_for(&mut count, deadline - now);
            if result.timed_out() && *count <= 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    pub fn release(&self) {
        let mut count = self.state.lock();
        *count += 1;
        self.condvar.notify_one();
    }

    pub fn release_n(&self, n: usize) {
        let mut count = self.state.lock();
        *count += n as isize;
        self.condvar.notify_all();
    }
}

/// A binary semaphore: the per-object lock from spec §3 ("a binary
/// semaphore serialising reads/writes"). Unlike a plain `Mutex`, `unlock`
/// can be called from a different logical section than `lock` (needed by
/// pipe waits, which drop the object's semaphore explicitly before
/// suspending and reacquire it after waking — spec §4.3/§5).
#[derive(Debug, Default)]
pub struct BinarySema {
    inner: Sema,
    // starts "available": one permit.
}

impl BinarySema {
    pub fn new() -> Self {
        Self {
            inner: Sema::new(1),
        }
    }

    pub fn lock(&self) {
        self.inner.acquire();
    }

    pub fn unlock(&self) {
        self.inner.release();
    }

    /// Runs `f` with the semaphore held, unlocking even on panic/early
    /// return via the returned guard.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let _guard = scopeguard::guard((), |()| self.unlock());
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sema_basic_acquire_release() {
        let sema = Sema::new(1);
        sema.acquire();
        assert!(!sema.acquire_timeout(Duration::from_millis(10)));
        sema.release();
        sema.acquire();
    }

    #[test]
    fn sema_wakes_waiter() {
        let sema = Arc::new(Sema::new(0));
        let sema2 = sema.clone();
        let handle = thread::spawn(move || {
            sema2.acquire();
        });
        thread::sleep(Duration::from_millis(20));
        sema.release();
        handle.join().unwrap();
    }

    #[test]
    fn binary_sema_mutual_exclusion() {
        let sema = BinarySema::new();
        sema.with_lock(|| {
            // lock is held here; a recursive attempt with a timeout would block,
            // but we only assert that unlock happens on scope exit.
        });
        sema.with_lock(|| {});
    }
}
