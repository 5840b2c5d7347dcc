//! Unix-domain sockets (spec §4.4): `Generic` → `Server` → `Server`
//! (listening) → `accept` → `Data`, and a client's `Generic` →
//! `Connecting` → `Connected`/`NotConnected`. The process-wide bind
//! namespace is a single list guarded by one lock, mirroring
//! `original_source/user/userSocketUnix.c`'s `uwsNamespace` rather than a
//! per-cartel table (a bind in one cartel must be connectable from any
//! other).

use std::collections::VecDeque;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use waitcell::{EventMask, NotifyList, WorldId};

use crate::error::{Result, Status};
use crate::ids::CartelId;
use crate::object::{ChildLookup, DirectoryOps, Object, ObjectOps, ObjectType};
use crate::pipe::{self, PipeEnd};
use crate::poll::PollMode;
use crate::scheduler::{Scheduler, WakeReason};

/// A pending connection handed from a connector to the listener it named
/// (spec §4.4 "accept allocates two cross-wired one-directional pipes"):
/// one pipe pair flows in each direction, and each side sees a
/// `UnixDataSocket` wrapping its own read/write ends.
struct PendingConnection {
    accepted_read: Arc<PipeEnd>,
    accepted_write: Arc<PipeEnd>,
}

struct ListenerState {
    backlog: Mutex<VecDeque<PendingConnection>>,
    backlog_max: usize,
    waiters: NotifyList,
}

impl ListenerState {
    fn try_push(&self, conn: PendingConnection) -> bool {
        let mut backlog = self.backlog.lock();
        if backlog.len() >= self.backlog_max {
            return false;
        }
        backlog.push_back(conn);
        true
    }

    fn try_pop(&self) -> Option<PendingConnection> {
        self.backlog.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.backlog.lock().is_empty()
    }
}

/// A name bound into the namespace, plus the listener state once
/// `listen()` has been called on it (spec §4.4: a bound-but-not-listening
/// socket rejects `connect` with `ECONNREFUSED`, matching an abstract or
/// orphaned bind).
struct Binding {
    name: String,
    listening: Mutex<Option<Arc<ListenerState>>>,
}

struct Namespace {
    bindings: Mutex<Vec<Arc<Binding>>>,
}

impl Namespace {
    fn new() -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
        }
    }

    fn bind(&self, name: &str) -> Result<Arc<Binding>> {
        let mut bindings = self.bindings.lock();
        if bindings.iter().any(|b| b.name == name) {
            return Err(Status::EAddrInUse);
        }
        let binding = Arc::new(Binding {
            name: name.to_string(),
            listening: Mutex::new(None),
        });
        bindings.push(binding.clone());
        Ok(binding)
    }

    fn unbind(&self, name: &str) {
        self.bindings.lock().retain(|b| b.name != name);
    }

    fn find(&self, name: &str) -> Option<Arc<Binding>> {
        self.bindings.lock().iter().find(|b| b.name == name).cloned()
    }
}

static NAMESPACE: Lazy<Namespace> = Lazy::new(Namespace::new);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ConnectState {
    Unbound,
    Bound,
    Listening,
    Connected,
    NotConnected,
}

/// Backs both the `Generic` and `Server` object variants (spec §3: they
/// share a lifecycle up through `bind`/`listen`). Which one a given
/// `Object` is tagged as only matters for `object_type()`; the namespace
/// transitions are identical.
pub struct UnixGenericSocket {
    state: Mutex<ConnectState>,
    name: Mutex<Option<String>>,
    binding: Mutex<Option<Arc<Binding>>>,
    listener: Mutex<Option<Arc<ListenerState>>>,
    cartel: CartelId,
    scheduler: Arc<dyn Scheduler>,
    pipe_buffer_size: usize,
    unix_backlog_max: usize,
}

impl std::fmt::Debug for UnixGenericSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixGenericSocket")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl UnixGenericSocket {
    pub fn new(
        cartel: CartelId,
        scheduler: Arc<dyn Scheduler>,
        pipe_buffer_size: usize,
        unix_backlog_max: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectState::Unbound),
            name: Mutex::new(None),
            binding: Mutex::new(None),
            listener: Mutex::new(None),
            cartel,
            scheduler,
            pipe_buffer_size,
            unix_backlog_max,
        })
    }

    /// `bind(2)` (spec §4.4): claims `name` in the process-wide namespace.
    pub fn bind(&self, name: &str, name_max: usize) -> Result<()> {
        if name.len() > name_max {
            return Err(Status::NameTooLong);
        }
        let mut state = self.state.lock();
        if *state != ConnectState::Unbound {
            return Err(Status::BadParam);
        }
        let binding = NAMESPACE.bind(name)?;
        *self.binding.lock() = Some(binding);
        *self.name.lock() = Some(name.to_string());
        *state = ConnectState::Bound;
        Ok(())
    }

    /// `listen(2)`: turns a bound socket into one that accepts incoming
    /// connections (spec §4.4 "Server(listening)").
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ConnectState::Bound {
            return Err(Status::BadParam);
        }
        let binding = self.binding.lock().clone().ok_or(Status::BadParam)?;
        let listener = Arc::new(ListenerState {
            backlog: Mutex::new(VecDeque::new()),
            backlog_max: backlog.min(self.unix_backlog_max).max(1),
            waiters: NotifyList::new(),
        });
        *binding.listening.lock() = Some(listener.clone());
        *self.listener.lock() = Some(listener);
        *state = ConnectState::Listening;
        Ok(())
    }

    /// `connect(2)`: looks the name up in the namespace and, if it names
    /// a listening socket with backlog room, performs the cross-wired
    /// pipe handoff synchronously (spec §4.4 lifecycle: `Connecting` is
    /// not separately observable here since this implementation never
    /// blocks waiting for `accept` — the backlog either has room or it
    /// doesn't, matching a stream-socket connect racing a full backlog).
    pub fn connect(self: &Arc<Self>, name: &str) -> Result<Arc<UnixDataSocket>> {
        {
            let mut state = self.state.lock();
            if *state == ConnectState::Connected {
                return Err(Status::BadParam);
            }
            *state = ConnectState::NotConnected;
        }

        let binding = NAMESPACE.find(name).ok_or(Status::EConnRefused)?;
        let listener = binding.listening.lock().clone().ok_or(Status::EConnRefused)?;

        let (client_read, server_write) = pipe::new_pair(
            self.pipe_buffer_size,
            self.cartel,
            self.cartel,
            self.scheduler.clone(),
        );
        let (server_read, client_write) = pipe::new_pair(
            self.pipe_buffer_size,
            self.cartel,
            self.cartel,
            self.scheduler.clone(),
        );

        let accepted = PendingConnection {
            accepted_read: server_read,
            accepted_write: server_write,
        };
        if !listener.try_push(accepted) {
            return Err(Status::LimitExceeded);
        }

        let woken = listener.waiters.wake_all();
        for world in woken {
            self.scheduler.wakeup(world);
        }

        *self.state.lock() = ConnectState::Connected;
        Ok(UnixDataSocket::new(client_read, client_write))
    }

    /// `accept(2)`: pops the oldest pending connection, or blocks until
    /// one arrives.
    pub fn accept(&self, world: WorldId, nonblock: bool) -> Result<Arc<UnixDataSocket>> {
        let listener = self.listener.lock().clone().ok_or(Status::BadParam)?;
        loop {
            if let Some(conn) = listener.try_pop() {
                return Ok(UnixDataSocket::new(conn.accepted_read, conn.accepted_write));
            }
            if nonblock {
                return Err(Status::WouldBlock);
            }
            listener.waiters.notify(world, EventMask::READ);
            let reason = self.scheduler.wait(world, None);
            listener.waiters.cleanup(world);
            if reason == WakeReason::Interrupted {
                return Err(Status::WaitInterrupted);
            }
        }
    }

    pub fn local_name(&self) -> Option<String> {
        self.name.lock().clone()
    }
}

/// Data socket: a pair of pipes wearing a socket-shaped API (spec §4.4:
/// "Data" state). `read`/`write`/`poll` all delegate straight to the
/// underlying pipe ends.
pub struct UnixDataSocket {
    read: Arc<PipeEnd>,
    write: Arc<PipeEnd>,
}

impl std::fmt::Debug for UnixDataSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixDataSocket").finish_non_exhaustive()
    }
}

impl UnixDataSocket {
    fn new(read: Arc<PipeEnd>, write: Arc<PipeEnd>) -> Arc<Self> {
        Arc::new(Self { read, write })
    }

    /// `sendmsg`'s fd-passing path (spec §4.3 "FD passing"): stashed on
    /// the write end so the peer's `recvmsg` (reading from the
    /// complementary end) picks it up.
    pub fn stash_fd(&self, object: Object) -> Result<()> {
        self.write.stash_fd(object)
    }

    pub fn take_fd(&self) -> Option<crate::pipe::InFlightFd> {
        self.read.take_fd()
    }
}

impl ObjectOps for UnixDataSocket {
    fn object_type(&self) -> ObjectType {
        ObjectType::SocketUnixData
    }

    fn close(&self) {
        self.read.close();
        self.write.close();
    }

    fn read(&self, object: &Object, buf: &mut [u8]) -> Result<usize> {
        self.read.read(object, buf)
    }

    fn write(&self, object: &Object, buf: &[u8]) -> Result<usize> {
        self.write.write(object, buf)
    }

    fn poll(&self, object: &Object, interest: EventMask, mode: PollMode, world: WorldId) -> Result<EventMask> {
        let r = self.read.poll(object, interest, mode, world)?;
        let w = self.write.poll(object, interest, mode, world)?;
        Ok(r | w)
    }

    fn to_string_repr(&self) -> String {
        "Socket(unix data)".to_string()
    }
}

/// The same type backs the bound-but-not-listening and the listening
/// server states (spec §3 `SocketUnixServer`); only `object_type()`'s
/// snapshot of `ConnectState` distinguishes them, via `crate::facade`
/// driving `bind`/`listen`.
pub type UnixServerSocket = UnixGenericSocket;

impl ObjectOps for UnixGenericSocket {
    fn object_type(&self) -> ObjectType {
        match *self.state.lock() {
            ConnectState::Bound | ConnectState::Listening => ObjectType::SocketUnixServer,
            _ => ObjectType::SocketUnixGeneric,
        }
    }

    fn close(&self) {
        if let Some(name) = self.name.lock().clone() {
            NAMESPACE.unbind(&name);
        }
    }

    fn poll(&self, _object: &Object, interest: EventMask, mode: PollMode, world: WorldId) -> Result<EventMask> {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            return Ok(EventMask::empty());
        };
        let current = if listener.is_empty() {
            EventMask::empty()
        } else {
            EventMask::READ
        };
        match mode {
            PollMode::Notify => {
                if !current.intersects(interest) {
                    listener.waiters.notify(world, interest);
                }
            }
            PollMode::Cleanup => listener.waiters.cleanup(world),
            PollMode::NoAction => {}
        }
        Ok(current)
    }

    fn to_string_repr(&self) -> String {
        format!("Socket(unix {:?})", *self.state.lock())
    }
}

impl DirectoryOps for UnixGenericSocket {
    fn lookup_child(&self, _name: &str, _flags: crate::flags::OpenFlags) -> Result<ChildLookup> {
        Err(Status::NotADirectory)
    }

    fn create_child(&self, _name: &str, _flags: crate::flags::OpenFlags, _mode: u32) -> Result<Object> {
        Err(Status::NotADirectory)
    }

    fn unlink_child(&self, _name: &str, _is_dir_hint: bool) -> Result<()> {
        Err(Status::NotADirectory)
    }

    fn rename_child(&self, _name: &str, _new_parent: &dyn DirectoryOps, _new_name: &str) -> Result<()> {
        Err(Status::NotADirectory)
    }

    fn mkdir(&self, _name: &str, _mode: u32) -> Result<()> {
        Err(Status::NotADirectory)
    }

    fn symlink(&self, _name: &str, _target: &str) -> Result<()> {
        Err(Status::NotADirectory)
    }

    fn hardlink(&self, _name: &str, _target: &dyn DirectoryOps, _target_name: &str) -> Result<()> {
        Err(Status::NotADirectory)
    }

    fn readlink(&self, _name: &str) -> Result<String> {
        Err(Status::NotADirectory)
    }

    fn mknod(&self, _name: &str, _mode: u32, _dev: u64) -> Result<()> {
        Err(Status::NotADirectory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::local::LocalScheduler;

    fn new_socket() -> Arc<UnixGenericSocket> {
        let scheduler: Arc<dyn Scheduler> = LocalScheduler::new();
        UnixGenericSocket::new(CartelId(1), scheduler, 512, 128)
    }

    #[test]
    fn bind_then_bind_again_is_rejected() {
        let a = new_socket();
        let name = format!("/tmp/test-bind-{}", std::process::id());
        a.bind(&name, 108).unwrap();
        let b = new_socket();
        assert_eq!(b.bind(&name, 108).unwrap_err(), Status::EAddrInUse);
        NAMESPACE.unbind(&name);
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let a = new_socket();
        assert_eq!(
            a.connect("/tmp/does-not-exist-unixsock").unwrap_err(),
            Status::EConnRefused
        );
    }

    #[test]
    fn connect_past_backlog_limit_is_limit_exceeded() {
        let server = new_socket();
        let name = format!("/tmp/test-backlog-{}", std::process::id());
        server.bind(&name, 108).unwrap();
        server.listen(1).unwrap();

        let first = new_socket();
        first.connect(&name).unwrap();

        let second = new_socket();
        assert_eq!(second.connect(&name).unwrap_err(), Status::LimitExceeded);

        NAMESPACE.unbind(&name);
    }

    #[test]
    fn connect_then_accept_exchanges_data() {
        let server = new_socket();
        let name = format!("/tmp/test-accept-{}", std::process::id());
        server.bind(&name, 108).unwrap();
        server.listen(4).unwrap();

        let client = new_socket();
        let client_sock = client.connect(&name).unwrap();

        let server_sock = server.accept(WorldId(0), false).unwrap();

        let obj = Object::new_unix_data(client_sock.clone(), crate::flags::OpenFlags::RDWR);
        obj.write(b"hi").unwrap();

        let server_obj = Object::new_unix_data(server_sock, crate::flags::OpenFlags::RDWR);
        let mut buf = [0u8; 8];
        let n = server_obj.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");

        NAMESPACE.unbind(&name);
    }
}
