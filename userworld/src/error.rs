//! The closed error enumeration from spec §7, modeled on the teacher's
//! `sysx::mach::kern_return::KernReturn`: a flat, `#[non_exhaustive]` enum
//! with one variant per kind, a `Display`/`Error` impl via `thiserror`, and
//! conversion to/from the wire's raw status code. Unlike `KernReturn` there
//! is no `Unknown(raw)` escape hatch — the spec calls for a *closed* set,
//! and the wire layer (`crate::proxy::wire`) maps anything it doesn't
//! recognise to `Status::InvalidHandle` rather than inventing a variant.

use thiserror::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum Status {
    #[error("success")]
    Ok,
    #[error("file exists")]
    Exists,
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    NoAccess,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("symbolic link encountered")]
    IsSymlink,
    #[error("name too long")]
    NameTooLong,
    #[error("cross-device link")]
    CrossDevice,
    #[error("invalid argument")]
    BadParam,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("out of memory")]
    NoMemory,
    #[error("insufficient resources")]
    NoResources,
    #[error("no free descriptors")]
    NoFreeHandles,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation is still pending")]
    StatusPending,
    #[error("wait interrupted by signal")]
    WaitInterrupted,
    #[error("operation timed out")]
    Timeout,
    #[error("peer is disconnected")]
    IsDisconnected,
    #[error("limit exceeded")]
    LimitExceeded,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("illegal seek")]
    IllegalSeek,
    #[error("not a socket")]
    NotASocket,
    #[error("address family not supported")]
    AddrFamUnsupp,
    #[error("connection refused")]
    EConnRefused,
    #[error("address already in use")]
    EAddrInUse,
    #[error("resource busy")]
    Busy,
}

pub type Result<T> = std::result::Result<T, Status>;

impl Status {
    /// The severe-error bit from spec §4.5/§6: set on the wire when the
    /// remote could not marshal a full reply.
    pub const SEVERE_BIT: u32 = 1 << 31;

    /// Decodes a raw wire status word, stripping the severe-error bit
    /// (spec §7: "Severe-error-flagged proxy replies surface the
    /// underlying kind with the severe-error bit stripped"). Returns the
    /// decoded status and whether the severe bit was set.
    pub fn from_wire(raw: u32) -> (Self, bool) {
        let severe = raw & Self::SEVERE_BIT != 0;
        let code = raw & !Self::SEVERE_BIT;
        (Self::from_code(code), severe)
    }

    pub fn to_wire(self) -> u32 {
        self.code()
    }

    fn code(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::Exists => 1,
            Status::NotFound => 2,
            Status::NoAccess => 3,
            Status::NotADirectory => 4,
            Status::IsADirectory => 5,
            Status::IsSymlink => 6,
            Status::NameTooLong => 7,
            Status::CrossDevice => 8,
            Status::BadParam => 9,
            Status::InvalidHandle => 10,
            Status::NoMemory => 11,
            Status::NoResources => 12,
            Status::NoFreeHandles => 13,
            Status::BrokenPipe => 14,
            Status::WouldBlock => 15,
            Status::StatusPending => 16,
            Status::WaitInterrupted => 17,
            Status::Timeout => 18,
            Status::IsDisconnected => 19,
            Status::LimitExceeded => 20,
            Status::NotSupported => 21,
            Status::NotImplemented => 22,
            Status::IllegalSeek => 23,
            Status::NotASocket => 24,
            Status::AddrFamUnsupp => 25,
            Status::EConnRefused => 26,
            Status::EAddrInUse => 27,
            Status::Busy => 28,
        }
    }

    /// Any code the wire layer doesn't recognise collapses to
    /// `InvalidHandle` rather than growing the enum (spec §7:
    /// "Proxy transport errors ... are translated to handle-shaped
    /// errors").
    fn from_code(code: u32) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::Exists,
            2 => Status::NotFound,
            3 => Status::NoAccess,
            4 => Status::NotADirectory,
            5 => Status::IsADirectory,
            6 => Status::IsSymlink,
            7 => Status::NameTooLong,
            8 => Status::CrossDevice,
            9 => Status::BadParam,
            10 => Status::InvalidHandle,
            11 => Status::NoMemory,
            12 => Status::NoResources,
            13 => Status::NoFreeHandles,
            14 => Status::BrokenPipe,
            15 => Status::WouldBlock,
            16 => Status::StatusPending,
            17 => Status::WaitInterrupted,
            18 => Status::Timeout,
            19 => Status::IsDisconnected,
            20 => Status::LimitExceeded,
            21 => Status::NotSupported,
            22 => Status::NotImplemented,
            23 => Status::IllegalSeek,
            24 => Status::NotASocket,
            25 => Status::AddrFamUnsupp,
            26 => Status::EConnRefused,
            27 => Status::EAddrInUse,
            28 => Status::Busy,
            _ => Status::InvalidHandle,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Suppresses a trailing non-`Ok` status when at least one byte of user
/// work completed, per spec §7 "Partial progress": the next call will
/// observe the error.
pub fn mask_partial_progress(bytes_done: usize, status: Status) -> Status {
    if bytes_done > 0 {
        Status::Ok
    } else {
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severe_bit_round_trips() {
        let raw = Status::NotFound.to_wire() | Status::SEVERE_BIT;
        let (status, severe) = Status::from_wire(raw);
        assert_eq!(status, Status::NotFound);
        assert!(severe);
    }

    #[test]
    fn unknown_code_collapses_to_invalid_handle() {
        let (status, severe) = Status::from_wire(0xdead);
        assert_eq!(status, Status::InvalidHandle);
        assert!(!severe);
    }

    #[test]
    fn partial_progress_masks_error() {
        assert_eq!(mask_partial_progress(3, Status::WouldBlock), Status::Ok);
        assert_eq!(mask_partial_progress(0, Status::WouldBlock), Status::WouldBlock);
    }
}
