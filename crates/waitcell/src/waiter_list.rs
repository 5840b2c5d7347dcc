use std::collections::HashMap;

use generational_arena::{Arena, Index};
use parking_lot::Mutex;

use crate::event::EventMask;

/// Identifies the suspended thread a waiter node belongs to. Spec §3:
/// "waiters are identified by `worldId` (never pointer-equality) for
/// removal" — a world can move between wait sites, so the arena `Index`
/// alone (which would be a pointer-equality-ish handle internal to one
/// list) is not enough on its own to let a *different* subsystem (e.g. a
/// signal-delivery path cancelling a wait) find and remove the node; the
/// id is the stable, externally-known handle.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct WorldId(pub u64);

#[derive(Debug, Copy, Clone)]
struct WaiterNode {
    world: WorldId,
    mask: EventMask,
}

/// Doubly-linked in spirit (spec §3), implemented with a
/// `generational_arena::Arena` rather than an intrusive list: the arena
/// gives us O(1) removal-by-handle and generation checks for free, which is
/// what the original's "list head has a magic-number tag in debug builds"
/// invariant was approximating by hand. The magic-number tag itself is
/// diagnostic-only (spec §9, "Global state") and is dropped here.
#[derive(Debug, Default)]
pub struct WaiterList {
    nodes: Mutex<Arena<WaiterNode>>,
}

impl WaiterList {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(Arena::new()),
        }
    }

    /// Registers `world` as waiting for any bit in `mask`. Returns a handle
    /// that must be passed to [`Self::remove`] on the poll-cleanup sweep
    /// (spec §4.7) even if the wait was satisfied by some other path (e.g.
    /// a timeout), to avoid leaking a stale node.
    pub fn add(&self, world: WorldId, mask: EventMask) -> Index {
        self.nodes.lock().insert(WaiterNode { world, mask })
    }

    pub fn remove(&self, handle: Index) {
        self.nodes.lock().remove(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Wakes and removes every waiter whose mask intersects `events`, or
    /// every waiter unconditionally if `events` carries an error bit (spec
    /// §4.5). Returns the set of world ids to notify via the scheduler
    /// (wakeup is the scheduler's job, out of scope here — spec §1).
    pub fn wake_matching(&self, events: EventMask) -> Vec<WorldId> {
        let mut nodes = self.nodes.lock();
        let wake_all = events.is_error();

        let mut woken = Vec::new();
        let mut to_remove = Vec::new();
        for (idx, node) in nodes.iter() {
            if wake_all || node.mask.intersects(events) {
                woken.push(node.world);
                to_remove.push(idx);
            }
        }
        for idx in to_remove {
            nodes.remove(idx);
        }
        woken
    }

    /// Wakes and removes every waiter, regardless of mask. Used when a
    /// handle is torn down out from under its waiters (writer/reader
    /// half-close, server-socket destruction).
    pub fn wake_all(&self) -> Vec<WorldId> {
        let mut nodes = self.nodes.lock();
        let woken: Vec<WorldId> = nodes.iter().map(|(_, n)| n.world).collect();
        nodes.clear();
        woken
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }
}

/// A `WaiterList` plus a per-world index of its own registrations, for
/// objects whose `poll()` computes readiness locally instead of caching a
/// remote generation (spec §4.7 steps 2-5: `Notify` registers, `Cleanup`
/// must find and drop exactly the node `Notify` added). `ObjectOps::poll`
/// only returns an `EventMask`, not the arena handle `WaiterList::add`
/// hands back, so something has to remember it between the two calls —
/// this is that something, keyed by the one thing both calls share: the
/// waiting world's id.
#[derive(Debug, Default)]
pub struct NotifyList {
    list: WaiterList,
    registered: Mutex<HashMap<WorldId, Index>>,
}

impl NotifyList {
    pub fn new() -> Self {
        Self {
            list: WaiterList::new(),
            registered: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `world` if it isn't already registered. Idempotent: a
    /// second `Notify` sweep for the same world before `Cleanup` runs is a
    /// no-op rather than leaking a second node.
    pub fn notify(&self, world: WorldId, mask: EventMask) {
        let mut registered = self.registered.lock();
        if registered.contains_key(&world) {
            return;
        }
        let idx = self.list.add(world, mask);
        registered.insert(world, idx);
    }

    /// Drops the node `notify` added for `world`, if any.
    pub fn cleanup(&self, world: WorldId) {
        if let Some(idx) = self.registered.lock().remove(&world) {
            self.list.remove(idx);
        }
    }

    pub fn wake_matching(&self, events: EventMask) -> Vec<WorldId> {
        let woken = self.list.wake_matching(events);
        self.forget(&woken);
        woken
    }

    pub fn wake_all(&self) -> Vec<WorldId> {
        let woken = self.list.wake_all();
        self.forget(&woken);
        woken
    }

    fn forget(&self, woken: &[WorldId]) {
        if woken.is_empty() {
            return;
        }
        let mut registered = self.registered.lock();
        for world in woken {
            registered.remove(world);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_matching_only_wakes_intersecting_masks() {
        let list = WaiterList::new();
        let a = list.add(WorldId(1), EventMask::READ);
        let b = list.add(WorldId(2), EventMask::WRITE);

        let woken = list.wake_matching(EventMask::READ);
        assert_eq!(woken, vec![WorldId(1)]);
        assert_eq!(list.len(), 1);

        list.remove(a);
        list.remove(b);
        assert!(list.is_empty());
    }

    #[test]
    fn error_bit_wakes_everyone() {
        let list = WaiterList::new();
        list.add(WorldId(1), EventMask::READ);
        list.add(WorldId(2), EventMask::WRITE);

        let mut woken = list.wake_matching(EventMask::RD_HUP);
        woken.sort();
        assert_eq!(woken, vec![WorldId(1), WorldId(2)]);
        assert!(list.is_empty());
    }

    #[test]
    fn wake_all_ignores_mask() {
        let list = WaiterList::new();
        list.add(WorldId(7), EventMask::WRITE);
        let woken = list.wake_all();
        assert_eq!(woken, vec![WorldId(7)]);
        assert!(list.is_empty());
    }

    #[test]
    fn notify_list_is_idempotent_and_cleanup_drops_the_node() {
        let notify = NotifyList::new();
        notify.notify(WorldId(1), EventMask::READ);
        notify.notify(WorldId(1), EventMask::READ);
        assert_eq!(notify.list.len(), 1);

        notify.cleanup(WorldId(1));
        assert!(notify.list.is_empty());
    }

    #[test]
    fn notify_list_forgets_woken_worlds() {
        let notify = NotifyList::new();
        notify.notify(WorldId(1), EventMask::READ);
        let woken = notify.wake_matching(EventMask::READ);
        assert_eq!(woken, vec![WorldId(1)]);

        // Already removed by wake_matching; cleanup must be a no-op, not a
        // double-remove panic.
        notify.cleanup(WorldId(1));
    }
}
