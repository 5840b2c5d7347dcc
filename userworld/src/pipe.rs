//! Anonymous pipes (spec §4.3): a fixed-size ring buffer shared by a
//! read end and a write end, with the POSIX atomic-write-below-`PIPE_BUF`
//! guarantee, half-close signalling, and the fd-passing stash `sendmsg`
//! on a unix socket's backing pipe uses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use waitcell::{EventMask, NotifyList, WorldId};

use crate::error::{mask_partial_progress, Result, Status};
use crate::ids::CartelId;
use crate::object::{Object, ObjectOps, ObjectType};
use crate::poll::PollMode;
use crate::scheduler::{Scheduler, WakeReason};

/// A single in-flight file descriptor stashed by `sendmsg` (spec §4.3 "FD
/// passing"). One slot: a second `sendmsg` before the first is consumed
/// fails with `LimitExceeded`.
#[derive(Debug, Clone)]
pub struct InFlightFd {
    pub object: Object,
}

struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn writable(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn push(&mut self, buf: &[u8]) {
        self.data.extend(buf.iter().copied());
    }

    fn pop_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.data.pop_front().expect("checked len above");
        }
        n
    }
}

struct Shared {
    buffer: Mutex<RingBuffer>,
    has_reader: AtomicBool,
    has_writer: AtomicBool,
    read_waiters: NotifyList,
    write_waiters: NotifyList,
    in_flight_fd: Mutex<Option<InFlightFd>>,
    read_cartel: CartelId,
    write_cartel: CartelId,
    scheduler: Arc<dyn Scheduler>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Side {
    Read,
    Write,
}

/// One end of a pipe. The same type backs both `Kind::PipeRead` and
/// `Kind::PipeWrite`; `side` picks which half of `Shared` a given instance
/// reads from.
pub struct PipeEnd {
    shared: Arc<Shared>,
    side: Side,
}

impl std::fmt::Debug for PipeEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEnd").field("side", &self.side).finish()
    }
}

/// Builds a connected pipe pair (spec §4.3, §5: "pipes carry `readCartel`
/// and `writeCartel` pointers"). `capacity` is the cartel's configured
/// `pipe_buffer_size` (also the atomic-write threshold, i.e. `PIPE_BUF`).
pub fn new_pair(
    capacity: usize,
    read_cartel: CartelId,
    write_cartel: CartelId,
    scheduler: Arc<dyn Scheduler>,
) -> (Arc<PipeEnd>, Arc<PipeEnd>) {
    let shared = Arc::new(Shared {
        buffer: Mutex::new(RingBuffer::new(capacity)),
        has_reader: AtomicBool::new(true),
        has_writer: AtomicBool::new(true),
        read_waiters: NotifyList::new(),
        write_waiters: NotifyList::new(),
        in_flight_fd: Mutex::new(None),
        read_cartel,
        write_cartel,
        scheduler,
    });
    let read_end = Arc::new(PipeEnd {
        shared: shared.clone(),
        side: Side::Read,
    });
    let write_end = Arc::new(PipeEnd {
        shared,
        side: Side::Write,
    });
    (read_end, write_end)
}

/// Folds spec §7's "partial progress masks a trailing error" rule into a
/// `Result`: some bytes made it through, so a non-success status is
/// reported only on the *next* call.
fn finish(bytes_done: usize, status: Status) -> Result<usize> {
    let masked = mask_partial_progress(bytes_done, status);
    if masked.is_ok() {
        Ok(bytes_done)
    } else {
        Err(masked)
    }
}

impl PipeEnd {
    pub fn read_cartel(&self) -> CartelId {
        self.shared.read_cartel
    }

    pub fn write_cartel(&self) -> CartelId {
        self.shared.write_cartel
    }

    /// Stashes `object` for a later `recvmsg` on the peer end (spec §4.3
    /// "FD passing"). Only one slot; a second attempt before the first is
    /// drained is rejected.
    pub fn stash_fd(&self, object: Object) -> Result<()> {
        let mut slot = self.shared.in_flight_fd.lock();
        if slot.is_some() {
            return Err(Status::LimitExceeded);
        }
        *slot = Some(InFlightFd { object });
        Ok(())
    }

    /// Consumes a previously stashed fd, if any (`recvmsg`'s counterpart
    /// to `stash_fd`).
    pub fn take_fd(&self) -> Option<InFlightFd> {
        self.shared.in_flight_fd.lock().take()
    }

    fn wake(&self, scheduler: &dyn Scheduler, worlds: Vec<WorldId>) {
        for world in worlds {
            scheduler.wakeup(world);
        }
    }

    fn events(&self) -> EventMask {
        let len = self.shared.buffer.lock().len();
        match self.side {
            Side::Read => {
                let mut events = EventMask::WRITE;
                if len > 0 {
                    events |= EventMask::READ;
                }
                if !self.shared.has_writer.load(Ordering::Acquire) && len == 0 {
                    events |= EventMask::WR_HUP;
                }
                events
            }
            Side::Write => {
                let mut events = EventMask::READ;
                if self.shared.buffer.lock().writable() > 0 {
                    events |= EventMask::WRITE;
                }
                if !self.shared.has_reader.load(Ordering::Acquire) {
                    events |= EventMask::RD_HUP;
                }
                events
            }
        }
    }

    fn waiters_for(&self, side: Side) -> &NotifyList {
        match side {
            Side::Read => &self.shared.read_waiters,
            Side::Write => &self.shared.write_waiters,
        }
    }
}

impl ObjectOps for PipeEnd {
    fn object_type(&self) -> ObjectType {
        match self.side {
            Side::Read => ObjectType::PipeRead,
            Side::Write => ObjectType::PipeWrite,
        }
    }

    fn close(&self) {
        let scheduler = self.shared.scheduler.clone();
        match self.side {
            Side::Read => {
                self.shared.has_reader.store(false, Ordering::Release);
                let woken = self.shared.write_waiters.wake_all();
                self.wake(&*scheduler, woken);
            }
            Side::Write => {
                self.shared.has_writer.store(false, Ordering::Release);
                let woken = self.shared.read_waiters.wake_all();
                self.wake(&*scheduler, woken);
            }
        }
    }

    fn read(&self, object: &Object, buf: &mut [u8]) -> Result<usize> {
        if self.side != Side::Read {
            return Err(Status::NotSupported);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let nonblock = object.open_flags().is_nonblocking();
        let world = self.shared.scheduler.current_world();

        object.lock();
        loop {
            let n = {
                let mut ring = self.shared.buffer.lock();
                ring.pop_into(buf)
            };

            if n > 0 {
                object.unlock();
                let woken = self.shared.write_waiters.wake_matching(EventMask::WRITE);
                self.wake(&*self.shared.scheduler, woken);
                return Ok(n);
            }

            if !self.shared.has_writer.load(Ordering::Acquire) {
                object.unlock();
                return Ok(0);
            }

            if nonblock {
                object.unlock();
                return Err(Status::WouldBlock);
            }

            self.shared.read_waiters.notify(world, EventMask::READ);
            object.unlock();
            let reason = self.shared.scheduler.wait(world, None);
            object.lock();
            self.shared.read_waiters.cleanup(world);

            if reason == WakeReason::Interrupted {
                object.unlock();
                return Err(Status::WaitInterrupted);
            }
        }
    }

    fn write(&self, object: &Object, buf: &[u8]) -> Result<usize> {
        if self.side != Side::Write {
            return Err(Status::NotSupported);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.shared.has_reader.load(Ordering::Acquire) {
            return Err(Status::BrokenPipe);
        }

        let nonblock = object.open_flags().is_nonblocking();
        let world = self.shared.scheduler.current_world();
        let capacity = self.shared.buffer.lock().capacity;
        let atomic = buf.len() <= capacity;

        object.lock();
        let mut written = 0usize;
        loop {
            if !self.shared.has_reader.load(Ordering::Acquire) {
                object.unlock();
                return finish(written, Status::BrokenPipe);
            }

            let remaining = &buf[written..];
            let progressed = {
                let mut ring = self.shared.buffer.lock();
                if atomic {
                    if remaining.len() <= ring.writable() {
                        ring.push(remaining);
                        remaining.len()
                    } else {
                        0
                    }
                } else {
                    let take = remaining.len().min(ring.writable());
                    ring.push(&remaining[..take]);
                    take
                }
            };

            written += progressed;

            if progressed > 0 {
                let woken = self.shared.read_waiters.wake_matching(EventMask::READ);
                self.wake(&*self.shared.scheduler, woken);
            }

            if written == buf.len() {
                object.unlock();
                return Ok(written);
            }

            if nonblock {
                object.unlock();
                return finish(written, Status::WouldBlock);
            }

            self.shared.write_waiters.notify(world, EventMask::WRITE);
            object.unlock();
            let reason = self.shared.scheduler.wait(world, None);
            object.lock();
            self.shared.write_waiters.cleanup(world);

            if reason == WakeReason::Interrupted {
                object.unlock();
                return finish(written, Status::WaitInterrupted);
            }
        }
    }

    fn poll(&self, _object: &Object, interest: EventMask, mode: PollMode, world: WorldId) -> Result<EventMask> {
        let current = self.events();
        match mode {
            PollMode::Notify => {
                if !current.intersects(interest) && !current.is_error() {
                    self.waiters_for(self.side).notify(world, interest);
                }
            }
            PollMode::Cleanup => {
                self.waiters_for(self.side).cleanup(world);
            }
            PollMode::NoAction => {}
        }
        Ok(current)
    }

    fn to_string_repr(&self) -> String {
        format!("{:?}", self.object_type())
    }
}
