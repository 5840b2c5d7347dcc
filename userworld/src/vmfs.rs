//! The VMFS sector-aligned file cache (spec §4.6): files resident on
//! VMFS-backed local storage bypass the host-resource proxy for I/O
//! (only `lookup`/`create` go through it — see `crate::proxy`) and are
//! instead read/written through an 8 KiB cache window over 512-byte
//! sectors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, Status};
use crate::object::{Object, ObjectOps, ObjectType};

/// The sector-addressable backing store a `VmfsFile` caches. A real
/// embedder backs this with an actual VMFS volume; tests use an
/// in-memory `Vec<u8>`.
pub trait Storage: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number actually read (short on EOF, never an error for reading
    /// past end-of-file — spec §4.6 "Reads past EOF return zero bytes").
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    fn len(&self) -> Result<u64>;

    fn set_len(&self, len: u64) -> Result<()>;
}

pub const SECTOR_SIZE: u64 = 512;
pub const CACHE_WINDOW: usize = 8192;

fn floor_sector(offset: u64) -> u64 {
    offset - (offset % SECTOR_SIZE)
}

struct Window {
    /// Sector-aligned offset this window currently covers; `None` before
    /// the first fill.
    base: Option<u64>,
    data: Vec<u8>,
    /// Bytes of `data` that hold real (fetched or written) content.
    valid_len: usize,
    dirty: bool,
}

impl Window {
    fn empty() -> Self {
        Self {
            base: None,
            data: vec![0u8; CACHE_WINDOW],
            valid_len: 0,
            dirty: false,
        }
    }

    fn covers(&self, offset: u64) -> bool {
        match self.base {
            Some(base) => offset >= base && offset < base + self.valid_len as u64,
            None => false,
        }
    }
}

struct State {
    window: Window,
    /// Cached end-of-file (spec §4.6 "EOF tracking"): avoids a `stat`
    /// round trip on every write.
    eof: u64,
    eof_dirty: bool,
    append: bool,
}

pub struct VmfsFile {
    storage: Arc<dyn Storage>,
    state: Mutex<State>,
    last_flush: Mutex<Instant>,
    flush_interval: Duration,
}

impl std::fmt::Debug for VmfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmfsFile").finish_non_exhaustive()
    }
}

impl VmfsFile {
    pub fn open(storage: Arc<dyn Storage>, append: bool, flush_interval: Duration) -> Result<Arc<Self>> {
        let eof = storage.len()?;
        Ok(Arc::new(Self {
            storage,
            state: Mutex::new(State {
                window: Window::empty(),
                eof,
                eof_dirty: false,
                append,
            }),
            last_flush: Mutex::new(Instant::now()),
            flush_interval,
        }))
    }

    /// Flushes the dirty window and any deferred EOF growth (spec §4.6
    /// "Periodic flush", and `fsync`/close).
    fn flush_locked(&self, state: &mut State) -> Result<()> {
        if state.window.dirty {
            if let Some(base) = state.window.base {
                self.storage.write_at(base, &state.window.data[..state.window.valid_len])?;
            }
            state.window.dirty = false;
        }
        if state.eof_dirty {
            self.storage.set_len(state.eof)?;
            state.eof_dirty = false;
        }
        Ok(())
    }

    /// Repositions the cache window to cover `sector_offset` (spec §4.6
    /// "Read": "the dirty region is flushed, the window is repositioned
    /// ... up to 8 KiB (bounded by aligned EOF) is read").
    fn reposition(&self, state: &mut State, sector_offset: u64) -> Result<()> {
        self.flush_locked(state)?;

        let want = CACHE_WINDOW.min((state.eof.saturating_sub(sector_offset)) as usize);
        let want = want.max(SECTOR_SIZE as usize).min(CACHE_WINDOW);
        let n = self.storage.read_at(sector_offset, &mut state.window.data[..want])?;

        state.window.base = Some(sector_offset);
        state.window.valid_len = n;
        state.window.dirty = false;
        Ok(())
    }

    /// Ensures the window covers `offset`, repositioning if needed.
    fn ensure_window(&self, state: &mut State, offset: u64) -> Result<()> {
        if state.window.covers(offset) {
            return Ok(());
        }
        let sector_offset = floor_sector(offset);
        self.reposition(state, sector_offset)
    }

    fn read_locked(&self, state: &mut State, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= state.eof {
            return Ok(0);
        }

        self.ensure_window(state, offset)?;

        let base = state.window.base.expect("just positioned");
        let window_off = (offset - base) as usize;
        if window_off >= state.window.valid_len {
            // A short underlying read moved EOF under us mid-call.
            return Ok(0);
        }

        let available = state.window.valid_len - window_off;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&state.window.data[window_off..window_off + n]);
        Ok(n)
    }

    fn write_locked(&self, state: &mut State, mut offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if state.append {
            offset = state.eof;
        }

        if !state.window.covers(offset) {
            let sector_offset = floor_sector(offset);
            let end = offset + buf.len() as u64;
            let aligned_start = offset % SECTOR_SIZE == 0;
            let aligned_end = end % SECTOR_SIZE == 0 || end >= state.eof;

            self.flush_locked(state)?;

            if aligned_start && aligned_end && buf.len() >= CACHE_WINDOW {
                // Large aligned write: go straight to storage, window
                // stays empty until the next read/write touches it.
                let n = self.storage.write_at(offset, buf)?;
                state.window.base = None;
                state.window.valid_len = 0;
                if offset + n as u64 > state.eof {
                    state.eof = offset + n as u64;
                    state.eof_dirty = true;
                }
                return Ok(n);
            }

            let want = CACHE_WINDOW.min((state.eof.saturating_sub(sector_offset).max(SECTOR_SIZE)) as usize);
            let n = match self.storage.read_at(sector_offset, &mut state.window.data[..want]) {
                Ok(n) => n,
                Err(Status::LimitExceeded) => 0,
                Err(e) => return Err(e),
            };
            state.window.base = Some(sector_offset);
            state.window.valid_len = n.max(((offset - sector_offset) as usize).min(want));
        }

        let base = state.window.base.expect("just positioned");
        let window_off = (offset - base) as usize;
        let n = buf.len().min(CACHE_WINDOW - window_off);
        let end = window_off + n;
        if end > state.window.data.len() {
            return Err(Status::BadParam);
        }
        state.window.data[window_off..end].copy_from_slice(&buf[..n]);
        state.window.valid_len = state.window.valid_len.max(end);
        state.window.dirty = true;

        let new_eof = offset + n as u64;
        if new_eof > state.eof {
            state.eof = new_eof;
            state.eof_dirty = true;
        }

        Ok(n)
    }

    fn maybe_periodic_flush(&self, state: &mut State) -> Result<()> {
        let mut last = self.last_flush.lock();
        if last.elapsed() >= self.flush_interval {
            self.flush_locked(state)?;
            *last = Instant::now();
        }
        Ok(())
    }
}

impl ObjectOps for VmfsFile {
    fn object_type(&self) -> ObjectType {
        ObjectType::File
    }

    fn close(&self) {
        let mut state = self.state.lock();
        let _ = self.flush_locked(&mut state);
    }

    fn read(&self, object: &Object, buf: &mut [u8]) -> Result<usize> {
        let offset = object.offset().max(0) as u64;
        let mut state = self.state.lock();
        self.read_locked(&mut state, offset, buf)
    }

    fn write(&self, object: &Object, buf: &[u8]) -> Result<usize> {
        let offset = object.offset().max(0) as u64;
        let mut state = self.state.lock();
        let n = self.write_locked(&mut state, offset, buf)?;
        self.maybe_periodic_flush(&mut state)?;
        Ok(n)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Result<u64> {
        Ok(self.state.lock().eof)
    }

    fn fsync(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Truncate (spec §4.6 "EOF tracking"): shrinking below the cache
    /// window trims or invalidates it; growing just moves `eof`.
    fn truncate(&self, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.eof = len;
        state.eof_dirty = true;

        if let Some(base) = state.window.base {
            if len <= base {
                state.window.base = None;
                state.window.valid_len = 0;
                state.window.dirty = false;
            } else if len < base + state.window.valid_len as u64 {
                state.window.valid_len = (len - base) as usize;
            }
        }

        self.flush_locked(&mut state)
    }

    fn to_string_repr(&self) -> String {
        "File(vmfs)".to_string()
    }
}

/// An in-memory `Storage` used by tests.
#[cfg(any(test, feature = "test-support"))]
pub struct MemStorage {
    data: Mutex<Vec<u8>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MemStorage {
    pub fn new(initial: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(initial),
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Storage for MemStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_file(initial: Vec<u8>) -> Arc<VmfsFile> {
        let storage = MemStorage::new(initial);
        VmfsFile::open(storage, false, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let file = new_test_file(vec![1, 2, 3]);
        let mut state = file.state.lock();
        let mut buf = [0u8; 8];
        assert_eq!(file.read_locked(&mut state, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_then_read_back_within_window() {
        let file = new_test_file(vec![0; 4096]);
        {
            let mut state = file.state.lock();
            file.write_locked(&mut state, 10, b"hello").unwrap();
        }
        let mut state = file.state.lock();
        let mut buf = [0u8; 5];
        file.read_locked(&mut state, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_grows_eof() {
        let file = new_test_file(vec![]);
        let mut state = file.state.lock();
        file.write_locked(&mut state, 0, b"abc").unwrap();
        assert_eq!(state.eof, 3);
        assert!(state.eof_dirty);
    }

    #[test]
    fn truncate_shrinks_window() {
        let file = new_test_file(vec![0; 4096]);
        {
            let mut state = file.state.lock();
            file.write_locked(&mut state, 0, b"hello world").unwrap();
        }
        file.truncate(5).unwrap();
        let state = file.state.lock();
        assert_eq!(state.eof, 5);
    }
}
