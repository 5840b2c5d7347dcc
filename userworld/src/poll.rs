//! The per-syscall poll protocol from spec §4.7, factored out of
//! `facade` because both single-fd `poll()` (used by `read`/`write`
//! blocking paths) and the multi-fd `poll(2)`-equivalent share it.

use std::time::Duration;

use waitcell::EventMask;

/// Which of the three sweeps `ObjectOps::poll` is being asked to perform
/// (spec §4.7 step 2-5).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PollMode {
    /// Register a waiter if not already ready (pre-arm).
    Notify,
    /// Re-check readiness without registering anything.
    NoAction,
    /// Drop any waiter node registered during `Notify`.
    Cleanup,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PollRequest {
    pub interest: EventMask,
    pub mode: PollMode,
}

/// One fd's entry in a multi-fd `poll()` call.
pub struct PollFd {
    pub fd: i32,
    pub interest: EventMask,
    pub revents: EventMask,
}

pub const POLL_FOREVER: Option<Duration> = None;
