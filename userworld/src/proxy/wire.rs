//! The host-resource proxy wire protocol (spec §4.5, §6): logical message
//! framing, fragmentation and the generation-tagged poll-cache piggyback.
//! Messages are modelled as typed Rust values rather than a raw byte
//! codec — [`ProxyTransport`] is the seam a real embedder plugs a byte
//! transport (and serializer) into; `Status::to_wire`/`from_wire` and
//! `OpenFlags::bits` already give the integer encodings a concrete
//! transport would need.

use crate::error::Status;
use crate::flags::OpenFlags;

/// Sentinel reserved handle (spec §6: "Sentinel reserved handle: -1").
pub const ROOT_HANDLE: u32 = u32::MAX;

pub type FileHandle = u32;
pub type Token = u64;

#[derive(Debug, Clone)]
pub enum Request {
    Lookup {
        parent: FileHandle,
        name: String,
        flags: OpenFlags,
    },
    Create {
        parent: FileHandle,
        name: String,
        flags: OpenFlags,
        mode: u32,
    },
    Unlink {
        parent: FileHandle,
        name: String,
        is_dir_hint: bool,
    },
    Rename {
        parent: FileHandle,
        name: String,
        new_name: String,
    },
    Mkdir {
        parent: FileHandle,
        name: String,
        mode: u32,
    },
    Symlink {
        parent: FileHandle,
        name: String,
        target: String,
    },
    Hardlink {
        parent: FileHandle,
        name: String,
        target_name: String,
    },
    Readlink {
        parent: FileHandle,
        name: String,
    },
    Mknod {
        parent: FileHandle,
        name: String,
        mode: u32,
        dev: u64,
    },
    Read {
        handle: FileHandle,
        offset: u64,
        len: u32,
    },
    Write {
        handle: FileHandle,
        offset: u64,
        data: Vec<u8>,
    },
    Stat {
        handle: FileHandle,
    },
    Close {
        handle: FileHandle,
    },
    Cancel {
        token: Token,
    },
}

/// What kind of remote resource a handle refers to (spec §3 `Type`'s
/// `Proxy{File,Fifo,Socket,Char}` variants, plus directories which the
/// spec reaches through the same `Proxy` family via `as_directory`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RemoteKind {
    File,
    Directory,
    Fifo,
    Socket,
    Char,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub handle: FileHandle,
    pub kind: RemoteKind,
    /// Set only when `kind == Symlink`: the link target, carried inline
    /// on the lookup reply so following it does not need a second
    /// round trip (spec §4.2 rule 4 just says "open yields `IsSymlink`";
    /// this is how this project's wire layer carries that outcome).
    pub symlink_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PollUpdate {
    pub events: u16,
    pub generation: u32,
}

#[derive(Debug, Clone)]
pub enum ReplyBody {
    Node(RemoteNode),
    Name(String),
    Data(Vec<u8>),
    Written(usize),
    Stat { size: u64, is_dir: bool },
    Unit,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: Status,
    pub severe: bool,
    pub poll: Option<PollUpdate>,
    pub body: ReplyBody,
}

impl Reply {
    pub fn ok(body: ReplyBody) -> Self {
        Self {
            status: Status::Ok,
            severe: false,
            poll: None,
            body,
        }
    }

    pub fn err(status: Status) -> Self {
        Self {
            status,
            severe: false,
            poll: None,
            body: ReplyBody::Unit,
        }
    }
}

/// One fragment of an outbound or inbound message (spec §4.5 "Framing"):
/// the first fragment of a reply carries the real token; later ones carry
/// [`Fragment::CONTINUATION`]. [`Fragment::Error`] is the one-byte
/// abort-mid-stream sentinel.
#[derive(Debug, Clone)]
pub enum Fragment {
    Request { token: Token, request: Request },
    Reply { token: Token, reply: Reply },
    Cancel { token: Token },
    /// The sender aborted mid-stream; no further fragments for `token`
    /// will arrive.
    Error { token: Token },
}

/// The transport a [`super::ProxyConnection`] fragments messages over.
/// `send` may return `Status::WouldBlock` to signal a transient
/// full-queue condition, which the connection retries with backoff (spec
/// §4.5 "Sending") before giving up and treating the link as disconnected.
pub trait ProxyTransport: Send + Sync {
    fn send(&self, fragment: Fragment) -> Result<(), Status>;

    /// Blocks until the next fragment addressed to this side arrives.
    fn recv(&self) -> Result<Fragment, Status>;
}
