//! The per-cartel bounded descriptor table (spec §3, §4.1): a fixed-size
//! array of slots, each `Empty`, `Reserved` (allocated but not yet
//! attached to an object), or holding an `Object`. Grounded on
//! `original_source/user/userObj.c`'s `cartel->fdState[]` table and its
//! two-phase "reserve a slot, then attach the object once it's fully
//! constructed" allocation pattern (spec §4.1 "Open"), which keeps a
//! concurrent `dup`/`close` from ever observing a half-built object.

use parking_lot::Mutex;

use crate::error::{Result, Status};
use crate::object::Object;

#[derive(Clone)]
enum Slot {
    Empty,
    Reserved,
    Occupied(Object),
}

pub struct DescriptorTable {
    slots: Mutex<Vec<Slot>>,
}

impl std::fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        let occupied = slots.iter().filter(|s| !matches!(s, Slot::Empty)).count();
        f.debug_struct("DescriptorTable")
            .field("capacity", &slots.len())
            .field("in_use", &occupied)
            .finish()
    }
}

impl DescriptorTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![Slot::Empty; capacity]),
        }
    }

    /// Reserves the lowest-numbered free slot (spec §4.1 "Open": fd
    /// allocation picks the lowest free number), returning it still
    /// empty of an object. Callers must follow up with `attach` or
    /// `unreserve`.
    pub fn reserve(&self) -> Result<i32> {
        self.reserve_from(0)
    }

    /// Reserves the lowest-numbered free slot at or above `min_fd` (spec
    /// §4.1 `fcntl(F_DUPFD)`/`dup(src, minFd)`: "scans forward from
    /// `minFd` for the first `Empty`").
    pub fn reserve_from(&self, min_fd: i32) -> Result<i32> {
        let mut slots = self.slots.lock();
        let start = usize::try_from(min_fd).unwrap_or(0);
        let idx = slots
            .iter()
            .enumerate()
            .skip(start)
            .position(|(_, s)| matches!(s, Slot::Empty))
            .map(|pos| pos + start)
            .ok_or(Status::NoFreeHandles)?;
        slots[idx] = Slot::Reserved;
        Ok(idx as i32)
    }

    /// Reserves a specific slot, evicting whatever occupied it (spec
    /// §4.1 `dup2`'s "as if close, then dup onto that exact number").
    /// Returns the previous occupant, if any, so the caller can run its
    /// `close` semantics (via `Drop`) after releasing any locks it needs
    /// to hold a moment longer. Fails with `Busy` if the slot is
    /// currently `Reserved` by a racing `open` (spec §4.1: "if `dst` is
    /// `Reserved`, fails — a racing open is protected from being
    /// stomped").
    pub fn reserve_at(&self, fd: i32) -> Result<Option<Object>> {
        let mut slots = self.slots.lock();
        let idx = usize::try_from(fd).map_err(|_| Status::InvalidHandle)?;
        if idx >= slots.len() {
            return Err(Status::InvalidHandle);
        }
        if matches!(slots[idx], Slot::Reserved) {
            return Err(Status::Busy);
        }
        let previous = match std::mem::replace(&mut slots[idx], Slot::Reserved) {
            Slot::Occupied(obj) => Some(obj),
            _ => None,
        };
        Ok(previous)
    }

    pub fn attach(&self, fd: i32, object: Object) -> Result<()> {
        let mut slots = self.slots.lock();
        let idx = usize::try_from(fd).map_err(|_| Status::InvalidHandle)?;
        let slot = slots.get_mut(idx).ok_or(Status::InvalidHandle)?;
        *slot = Slot::Occupied(object);
        tracing::debug!(fd, "descriptor attached");
        Ok(())
    }

    pub fn unreserve(&self, fd: i32) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if matches!(slot, Slot::Reserved) {
                *slot = Slot::Empty;
            }
        }
    }

    /// Looks up `fd`, returning a clone of the `Object` (an `Arc` bump —
    /// spec §3's refcount discipline: a caller holding this clone keeps
    /// the object alive even if another world closes the fd out from
    /// under it).
    pub fn find(&self, fd: i32) -> Result<Object> {
        let slots = self.slots.lock();
        let idx = usize::try_from(fd).map_err(|_| Status::InvalidHandle)?;
        match slots.get(idx) {
            Some(Slot::Occupied(obj)) => Ok(obj.clone()),
            _ => Err(Status::InvalidHandle),
        }
    }

    /// `close(2)`: clears the slot, returning the object so `Drop` runs
    /// once the caller drops its local binding (spec §3: "last release
    /// invokes `close`").
    pub fn close(&self, fd: i32) -> Result<Object> {
        let mut slots = self.slots.lock();
        let idx = usize::try_from(fd).map_err(|_| Status::InvalidHandle)?;
        let slot = slots.get_mut(idx).ok_or(Status::InvalidHandle)?;
        match std::mem::replace(slot, Slot::Empty) {
            Slot::Occupied(obj) => {
                tracing::debug!(fd, "descriptor closed");
                Ok(obj)
            }
            _ => {
                *slot = Slot::Empty;
                Err(Status::InvalidHandle)
            }
        }
    }

    /// `dup(2)`/`fcntl(F_DUPFD)`: allocates the lowest-free slot at or
    /// above `min_fd` pointing at the same object (spec §4.1
    /// `dup(src, minFd)`).
    pub fn dup(&self, fd: i32, min_fd: i32) -> Result<i32> {
        let object = self.find(fd)?;
        let new_fd = self.reserve_from(min_fd)?;
        self.attach(new_fd, object)?;
        tracing::debug!(fd, new_fd, "descriptor duplicated");
        Ok(new_fd)
    }

    /// `dup2(2)`: makes `new_fd` refer to the same object as `fd`,
    /// closing whatever `new_fd` previously held first.
    pub fn dup2(&self, fd: i32, new_fd: i32) -> Result<()> {
        if fd == new_fd {
            self.find(fd)?;
            return Ok(());
        }
        let object = self.find(fd)?;
        let previous = self.reserve_at(new_fd)?;
        self.attach(new_fd, object)?;
        drop(previous);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Snapshots the occupied `(fd, Object)` pairs under the lock, then
    /// releases it before the caller formats anything — matches the
    /// "dump under lock, then `toString` outside it" discipline spec §9
    /// calls out for any per-fd diagnostic dump, since `to_string_repr`
    /// on some variants may itself need to acquire an object lock.
    pub fn snapshot(&self) -> Vec<(i32, Object)> {
        let slots = self.slots.lock();
        slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Slot::Occupied(obj) => Some((idx as i32, obj.clone())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::OpenFlags;
    use crate::path::RootDir;
    use crate::proxy::tests::make_test_proxy;

    fn dummy_object() -> Object {
        Object::new_root(RootDir::new(make_test_proxy()), OpenFlags::STAT)
    }

    #[test]
    fn reserve_picks_lowest_free_slot() {
        let table = DescriptorTable::new(4);
        let fd0 = table.reserve().unwrap();
        assert_eq!(fd0, 0);
        table.attach(fd0, dummy_object()).unwrap();
        let fd1 = table.reserve().unwrap();
        assert_eq!(fd1, 1);
    }

    #[test]
    fn close_then_reserve_reuses_the_slot() {
        let table = DescriptorTable::new(2);
        let fd = table.reserve().unwrap();
        table.attach(fd, dummy_object()).unwrap();
        table.close(fd).unwrap();
        let fd2 = table.reserve().unwrap();
        assert_eq!(fd, fd2);
    }

    #[test]
    fn capacity_exhaustion_returns_no_free_handles() {
        let table = DescriptorTable::new(1);
        let fd = table.reserve().unwrap();
        table.attach(fd, dummy_object()).unwrap();
        assert_eq!(table.reserve().unwrap_err(), Status::NoFreeHandles);
    }

    #[test]
    fn dup2_onto_self_is_a_noop_check() {
        let table = DescriptorTable::new(2);
        let fd = table.reserve().unwrap();
        table.attach(fd, dummy_object()).unwrap();
        table.dup2(fd, fd).unwrap();
    }

    #[test]
    fn dup2_replaces_target_slot() {
        let table = DescriptorTable::new(3);
        let fd_a = table.reserve().unwrap();
        table.attach(fd_a, dummy_object()).unwrap();
        let fd_b = table.reserve().unwrap();
        table.attach(fd_b, dummy_object()).unwrap();

        table.dup2(fd_a, fd_b).unwrap();
        assert!(table.find(fd_b).unwrap().ptr_eq(&table.find(fd_a).unwrap()));
    }

    #[test]
    fn dup2_onto_a_reserved_slot_is_rejected() {
        let table = DescriptorTable::new(2);
        let fd = table.reserve().unwrap();
        table.attach(fd, dummy_object()).unwrap();
        let racing = table.reserve().unwrap();
        assert_eq!(table.dup2(fd, racing).unwrap_err(), Status::Busy);
    }

    #[test]
    fn dup_from_min_fd_scans_forward() {
        let table = DescriptorTable::new(4);
        let fd = table.reserve().unwrap();
        table.attach(fd, dummy_object()).unwrap();
        let dup_fd = table.dup(fd, 2).unwrap();
        assert_eq!(dup_fd, 2);
    }
}
