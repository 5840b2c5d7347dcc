//! The upward, syscall-shaped surface (spec §4.1, §6): every operation a
//! cartel's caller can invoke, expressed as plain functions over a
//! `&Cartel` rather than a single god-object method table — the same
//! flat-function style the teacher's `nio::posix` wrappers use over a
//! raw fd instead of wrapping it in a type.

use std::sync::Arc;
use std::time::Duration;

use waitcell::EventMask;

use crate::cartel::Cartel;
use crate::error::{Result, Status};
use crate::flags::{OpenFlags, TraverseFlags, Whence};
use crate::object::{FcntlCmd, Object};
use crate::path::Resolved;
use crate::pipe;
use crate::poll::{PollFd, PollMode, PollRequest};
use crate::scheduler::WakeReason;
use crate::unix_socket::UnixGenericSocket;

/// `open(2)` (spec §4.1, §4.2): resolves `path`, creating the final arc
/// if `OpenFlags::CREATE` is set, and installs the result in the lowest
/// free descriptor slot.
pub fn open(cartel: &Cartel, path: &str, flags: OpenFlags, mode: u32) -> Result<i32> {
    let resolved = cartel.resolve(path, flags, TraverseFlags::empty(), mode)?;
    let object = match resolved {
        Resolved::Object(obj) => {
            // Already existed before this call — `Create|Exclusive`
            // fails only in this case (spec.md:84), never when `Created`
            // below means this very call just made the arc.
            if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
                return Err(Status::Exists);
            }
            if flags.contains(OpenFlags::DIRECTORY) && obj.as_directory().is_none() {
                return Err(Status::NotADirectory);
            }
            obj
        }
        Resolved::Created(obj) => obj,
        Resolved::Parent(..) => return Err(Status::NotFound),
    };
    object.set_open_flags(flags);
    if flags.contains(OpenFlags::TRUNCATE) && flags.can_write() {
        object.truncate(0)?;
    }
    let fd = install(cartel, object)?;
    tracing::debug!(cartel = cartel.id.0, fd, path, "open");
    Ok(fd)
}

fn install(cartel: &Cartel, object: Object) -> Result<i32> {
    let fd = cartel.descriptors.reserve()?;
    cartel.descriptors.attach(fd, object)?;
    Ok(fd)
}

pub fn close(cartel: &Cartel, fd: i32) -> Result<()> {
    cartel.descriptors.close(fd)?;
    tracing::debug!(cartel = cartel.id.0, fd, "close");
    Ok(())
}

pub fn read(cartel: &Cartel, fd: i32, buf: &mut [u8]) -> Result<usize> {
    cartel.descriptors.find(fd)?.read(buf)
}

pub fn write(cartel: &Cartel, fd: i32, buf: &[u8]) -> Result<usize> {
    cartel.descriptors.find(fd)?.write(buf)
}

pub fn pread(cartel: &Cartel, fd: i32, buf: &mut [u8], offset: i64) -> Result<usize> {
    let object = cartel.descriptors.find(fd)?;
    let saved = object.offset();
    object.set_offset(offset);
    let result = object.read(buf);
    object.set_offset(saved);
    result
}

pub fn pwrite(cartel: &Cartel, fd: i32, buf: &[u8], offset: i64) -> Result<usize> {
    let object = cartel.descriptors.find(fd)?;
    let saved = object.offset();
    object.set_offset(offset);
    let result = object.write(buf);
    object.set_offset(saved);
    result
}

pub fn seek(cartel: &Cartel, fd: i32, whence: Whence, delta: i64) -> Result<i64> {
    cartel.descriptors.find(fd)?.seek(whence, delta)
}

pub fn truncate(cartel: &Cartel, fd: i32, len: u64) -> Result<()> {
    cartel.descriptors.find(fd)?.truncate(len)
}

pub fn fsync(cartel: &Cartel, fd: i32) -> Result<()> {
    cartel.descriptors.find(fd)?.fsync()
}

/// `fcntl(2)`: `F_DUPFD` is handled here rather than by `Object::fcntl`,
/// since it needs the descriptor table `Object` doesn't have access to.
pub fn fcntl(cartel: &Cartel, fd: i32, cmd: FcntlCmd) -> Result<i64> {
    if let FcntlCmd::DupFd(min_fd) = cmd {
        return dup(cartel, fd, min_fd).map(i64::from);
    }
    cartel.descriptors.find(fd)?.fcntl(cmd)
}

pub fn ioctl(cartel: &Cartel, fd: i32, request: u32, arg: &mut [u8]) -> Result<()> {
    cartel.descriptors.find(fd)?.ioctl(request, arg)
}

/// `dup(2)`/`fcntl(F_DUPFD, minFd)`: allocates the lowest-free slot at or
/// above `min_fd` (spec §4.1 `dup(src, minFd)`). Plain `dup(2)` passes
/// `min_fd = 0`.
pub fn dup(cartel: &Cartel, fd: i32, min_fd: i32) -> Result<i32> {
    cartel.descriptors.dup(fd, min_fd)
}

pub fn dup2(cartel: &Cartel, fd: i32, new_fd: i32) -> Result<()> {
    cartel.descriptors.dup2(fd, new_fd)
}

/// `stat`-equivalent: spec §4.1 exposes this as a flag on `open`
/// (`OpenFlags::STAT`) rather than a separate call that returns a struct
/// of its own, so the facade's stat-shaped surface is just `size`.
pub fn size(cartel: &Cartel, fd: i32) -> Result<u64> {
    cartel.descriptors.find(fd)?.size()
}

pub fn to_string_repr(cartel: &Cartel, fd: i32) -> Result<String> {
    Ok(cartel.descriptors.find(fd)?.to_string_repr())
}

pub fn mkdir(cartel: &Cartel, path: &str, mode: u32) -> Result<()> {
    match cartel.resolve(path, OpenFlags::STAT, TraverseFlags::PENULTIMATE, 0)? {
        Resolved::Parent(parent, name) => parent.as_directory().ok_or(Status::NotADirectory)?.mkdir(&name, mode),
        _ => Err(Status::Exists),
    }
}

pub fn rmdir(cartel: &Cartel, path: &str) -> Result<()> {
    unlink_inner(cartel, path, true)
}

pub fn unlink(cartel: &Cartel, path: &str) -> Result<()> {
    unlink_inner(cartel, path, false)
}

fn unlink_inner(cartel: &Cartel, path: &str, is_dir_hint: bool) -> Result<()> {
    match cartel.resolve(path, OpenFlags::STAT, TraverseFlags::PENULTIMATE, 0)? {
        Resolved::Parent(parent, name) => parent
            .as_directory()
            .ok_or(Status::NotADirectory)?
            .unlink_child(&name, is_dir_hint),
        _ => Err(Status::BadParam),
    }
}

pub fn make_symlink(cartel: &Cartel, path: &str, target: &str) -> Result<()> {
    match cartel.resolve(path, OpenFlags::STAT, TraverseFlags::PENULTIMATE, 0)? {
        Resolved::Parent(parent, name) => {
            parent.as_directory().ok_or(Status::NotADirectory)?.symlink(&name, target)
        }
        _ => Err(Status::Exists),
    }
}

pub fn read_symlink(cartel: &Cartel, path: &str) -> Result<String> {
    match cartel.resolve(
        path,
        OpenFlags::STAT,
        TraverseFlags::PENULTIMATE | TraverseFlags::NO_FOLLOW,
        0,
    )? {
        Resolved::Parent(parent, name) => parent.as_directory().ok_or(Status::NotADirectory)?.readlink(&name),
        _ => Err(Status::BadParam),
    }
}

/// `link(2)`: the wire protocol's `Hardlink` request only names one
/// parent handle (spec §4.5's `Request::Hardlink{parent,name,target_name}`),
/// so the existing entry `existing_name` must already live in the same
/// directory that `new_path` resolves into.
pub fn make_hardlink(cartel: &Cartel, new_path: &str, existing_name: &str) -> Result<()> {
    match cartel.resolve(new_path, OpenFlags::STAT, TraverseFlags::PENULTIMATE, 0)? {
        Resolved::Parent(parent, name) => {
            let dir = parent.as_directory().ok_or(Status::NotADirectory)?;
            dir.hardlink(&name, dir, existing_name)
        }
        _ => Err(Status::Exists),
    }
}

pub fn rename(cartel: &Cartel, path: &str, new_path: &str) -> Result<()> {
    let (old_parent, old_name) = match cartel.resolve(path, OpenFlags::STAT, TraverseFlags::PENULTIMATE, 0)? {
        Resolved::Parent(parent, name) => (parent, name),
        _ => return Err(Status::BadParam),
    };
    let (new_parent, new_name) = match cartel.resolve(new_path, OpenFlags::STAT, TraverseFlags::PENULTIMATE, 0)? {
        Resolved::Parent(parent, name) => (parent, name),
        _ => return Err(Status::Exists),
    };
    let old_dir = old_parent.as_directory().ok_or(Status::NotADirectory)?;
    let new_dir = new_parent.as_directory().ok_or(Status::NotADirectory)?;
    old_dir.rename_child(&old_name, new_dir, &new_name)
}

pub fn mknod(cartel: &Cartel, path: &str, mode: u32, dev: u64) -> Result<()> {
    match cartel.resolve(path, OpenFlags::STAT, TraverseFlags::PENULTIMATE, 0)? {
        Resolved::Parent(parent, name) => parent.as_directory().ok_or(Status::NotADirectory)?.mknod(&name, mode, dev),
        _ => Err(Status::Exists),
    }
}

pub fn chdir(cartel: &Cartel, path: &str) -> Result<()> {
    cartel.set_cwd(path)
}

/// `pipe(2)`: both ends are owned by the calling cartel (spec §5: pipes
/// carry `readCartel`/`writeCartel`; a plain `pipe()` call sets both to
/// the creator).
pub fn pipe2(cartel: &Cartel, flags: OpenFlags) -> Result<(i32, i32)> {
    let (read_end, write_end) = pipe::new_pair(
        cartel.config.pipe_buffer_size,
        cartel.id,
        cartel.id,
        cartel.scheduler.clone(),
    );
    let nonblock = flags & OpenFlags::NONBLOCK;
    let read_obj = Object::new_pipe_read(read_end, nonblock);
    let write_obj = Object::new_pipe_write(write_end, nonblock | OpenFlags::WRONLY);
    let rfd = install(cartel, read_obj)?;
    match install(cartel, write_obj) {
        Ok(wfd) => Ok((rfd, wfd)),
        Err(e) => {
            let _ = cartel.descriptors.close(rfd);
            Err(e)
        }
    }
}

pub fn socket_unix(cartel: &Cartel) -> Result<i32> {
    let sock = UnixGenericSocket::new(
        cartel.id,
        cartel.scheduler.clone(),
        cartel.config.pipe_buffer_size,
        cartel.config.unix_backlog_max,
    );
    install(cartel, Object::new_unix_generic(sock, OpenFlags::RDWR))
}

pub fn bind(cartel: &Cartel, fd: i32, name: &str) -> Result<()> {
    let object = cartel.descriptors.find(fd)?;
    let sock = object.as_unix_generic().ok_or(Status::NotASocket)?;
    sock.bind(name, cartel.config.unix_name_max)
}

/// `listen(2)`: promotes the fd from `Generic` to `Server` (spec §4.4) so
/// that `accept` — which only operates on a `Server` object — can find it.
pub fn listen(cartel: &Cartel, fd: i32, backlog: usize) -> Result<()> {
    let object = cartel.descriptors.find(fd)?;
    let sock = object.as_unix_generic().ok_or(Status::NotASocket)?.clone();
    sock.listen(backlog)?;
    reattach(cartel, fd, Object::new_unix_server(sock, object.open_flags()))
}

pub fn connect(cartel: &Cartel, fd: i32, name: &str) -> Result<()> {
    let object = cartel.descriptors.find(fd)?;
    let sock = object.as_unix_generic().ok_or(Status::NotASocket)?;
    let data = sock.connect(name)?;
    // `connect` on a stream socket hands the original fd a new identity
    // (the `Data` state) rather than allocating a fresh descriptor (spec
    // §4.4: `Generic` → `Connected`).
    let new_obj = Object::new_unix_data(data, object.open_flags());
    reattach(cartel, fd, new_obj)
}

pub fn accept(cartel: &Cartel, fd: i32) -> Result<i32> {
    let object = cartel.descriptors.find(fd)?;
    let sock = object.as_unix_server().ok_or(Status::NotASocket)?;
    let world = cartel.scheduler.current_world();
    let data = sock.accept(world, object.open_flags().is_nonblocking())?;
    install(cartel, Object::new_unix_data(data, OpenFlags::RDWR))
}

/// `getsockname`-equivalent: valid both before and after `listen` has
/// promoted the object from `Generic` to `Server` — `UnixServerSocket` is
/// the same underlying type (spec §3), so either tag answers this.
pub fn local_name(cartel: &Cartel, fd: i32) -> Result<Option<String>> {
    let object = cartel.descriptors.find(fd)?;
    let sock = object
        .as_unix_generic()
        .or_else(|| object.as_unix_server())
        .ok_or(Status::NotASocket)?;
    Ok(sock.local_name())
}

pub fn sendmsg_fd(cartel: &Cartel, fd: i32, passed_fd: i32) -> Result<()> {
    let object = cartel.descriptors.find(fd)?;
    let data = object.as_unix_data().ok_or(Status::NotASocket)?;
    let passed = cartel.descriptors.find(passed_fd)?;
    data.stash_fd(passed)
}

pub fn recvmsg_fd(cartel: &Cartel, fd: i32) -> Result<Option<i32>> {
    let object = cartel.descriptors.find(fd)?;
    let data = object.as_unix_data().ok_or(Status::NotASocket)?;
    match data.take_fd() {
        Some(in_flight) => Ok(Some(install(cartel, in_flight.object)?)),
        None => Ok(None),
    }
}

fn reattach(cartel: &Cartel, fd: i32, object: Object) -> Result<()> {
    cartel.descriptors.attach(fd, object)
}

/// Multi-fd `poll(2)` (spec §4.7's five-step protocol): pre-arm every
/// entry, short-circuit if anything is already ready, otherwise sleep
/// and re-sweep on wake, unregistering everything before returning.
pub fn poll(cartel: &Cartel, entries: &mut [PollFd], timeout: Option<Duration>) -> Result<usize> {
    let world = cartel.scheduler.current_world();

    let objects: Vec<Object> = entries
        .iter()
        .map(|e| cartel.descriptors.find(e.fd))
        .collect::<Result<_>>()?;

    let sweep = |mode: PollMode, entries: &mut [PollFd]| -> Result<usize> {
        let mut ready = 0;
        for (entry, object) in entries.iter_mut().zip(&objects) {
            let req = PollRequest {
                interest: entry.interest,
                mode,
            };
            let events = object.poll(req.interest, req.mode, world)?;
            entry.revents = events;
            if events.intersects(entry.interest) || events.is_error() {
                ready += 1;
            }
        }
        Ok(ready)
    };

    let ready = sweep(PollMode::Notify, entries)?;
    if ready > 0 || timeout == Some(Duration::ZERO) {
        sweep(PollMode::Cleanup, entries)?;
        return Ok(ready);
    }

    let reason = cartel.scheduler.wait(world, timeout);
    let ready = sweep(PollMode::NoAction, entries)?;
    sweep(PollMode::Cleanup, entries)?;

    if ready == 0 && reason == WakeReason::Interrupted {
        return Err(Status::WaitInterrupted);
    }
    Ok(ready)
}

/// Single-fd convenience used by blocking `read`/`write` callers that
/// only need to know "is this fd ready" rather than driving the full
/// multi-fd protocol themselves.
pub fn poll_one(cartel: &Arc<Cartel>, fd: i32, interest: EventMask, timeout: Option<Duration>) -> Result<EventMask> {
    let mut entries = [PollFd { fd, interest, revents: EventMask::empty() }];
    poll(cartel, &mut entries, timeout)?;
    Ok(entries[0].revents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CartelConfig;
    use crate::identity::Identity;
    use crate::ids::CartelId;
    use crate::proxy::tests::make_test_proxy;
    use crate::scheduler::local::LocalScheduler;

    fn new_test_cartel() -> Arc<Cartel> {
        let proxy = make_test_proxy();
        let scheduler: Arc<dyn crate::scheduler::Scheduler> = LocalScheduler::new();
        Cartel::new(CartelId(1), CartelConfig::default(), proxy, scheduler, Identity::default())
    }

    #[test]
    fn open_create_then_write_then_read() {
        let cartel = new_test_cartel();
        let fd = open(&cartel, "/hello", OpenFlags::CREATE | OpenFlags::RDWR, 0o644).unwrap();
        assert_eq!(write(&cartel, fd, b"abc").unwrap(), 3);
        seek(&cartel, fd, Whence::Set, 0).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(read(&cartel, fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        close(&cartel, fd).unwrap();
    }

    #[test]
    fn pipe_round_trip() {
        let cartel = new_test_cartel();
        let (rfd, wfd) = pipe2(&cartel, OpenFlags::empty()).unwrap();
        write(&cartel, wfd, b"ping").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read(&cartel, rfd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn dup_shares_the_same_object() {
        let cartel = new_test_cartel();
        let (rfd, _wfd) = pipe2(&cartel, OpenFlags::empty()).unwrap();
        let dup_fd = dup(&cartel, rfd, 0).unwrap();
        assert!(cartel.descriptors.find(rfd).unwrap().ptr_eq(&cartel.descriptors.find(dup_fd).unwrap()));
    }

    #[test]
    fn unix_socket_bind_connect_accept() {
        let cartel = new_test_cartel();
        let server_fd = socket_unix(&cartel).unwrap();
        let name = format!("/tmp/facade-test-{}", std::process::id());
        bind(&cartel, server_fd, &name).unwrap();
        listen(&cartel, server_fd, 4).unwrap();

        let client_fd = socket_unix(&cartel).unwrap();
        connect(&cartel, client_fd, &name).unwrap();

        let accepted_fd = accept(&cartel, server_fd).unwrap();
        write(&cartel, client_fd, b"hi").unwrap();
        let mut buf = [0u8; 4];
        let n = read(&cartel, accepted_fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
