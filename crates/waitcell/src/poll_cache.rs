use parking_lot::Mutex;

use crate::event::EventMask;
use crate::waiter_list::{WaiterList, WorldId};

/// Shared, refcounted event-state cache for a remote-backed handle (spec
/// §3 "Poll cache", §4.5). `enabled` starts `false`: a freshly-opened
/// proxied handle has no cached events until the first reply piggybacks
/// one.
///
/// Several proxied objects can point at the *same* `PollCache` when the
/// remote multiplexes one pollable entity through many handles (spec §3).
/// This project expresses that sharing as `Arc<PollCache>` rather than a
/// hand-rolled refcount: `Arc::strong_count` already *is* the `refCount`
/// field the spec enumerates, so duplicating it as a separate atomic would
/// just be two sources of truth for the same number.
#[derive(Debug)]
pub struct PollCache {
    state: Mutex<State>,
    waiters: WaiterList,
}

#[derive(Debug, Default)]
struct State {
    enabled: bool,
    events: EventMask,
    generation: u32,
}

impl Default for PollCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PollCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            waiters: WaiterList::new(),
        }
    }

    pub fn waiters(&self) -> &WaiterList {
        &self.waiters
    }

    pub fn snapshot(&self) -> (bool, EventMask, u32) {
        let s = self.state.lock();
        (s.enabled, s.events, s.generation)
    }

    /// Applies a generation-tagged update from a proxy reply (spec §4.5).
    /// Uses wrapping/modular comparison so a `u32` generation counter can
    /// wrap without momentarily looking "older" than everything: the
    /// update is accepted iff `new_generation.wrapping_sub(old) as i32 > 0`,
    /// which is the standard TCP-sequence-number style comparison.
    ///
    /// Returns the ids of waiters to wake, or an empty vec if the update
    /// was stale and dropped.
    pub fn update(&self, new_events: EventMask, new_generation: u32) -> Vec<WorldId> {
        let mut s = self.state.lock();

        let accept = if !s.enabled {
            true
        } else {
            (new_generation.wrapping_sub(s.generation) as i32) > 0
        };

        if !accept {
            tracing::trace!(
                new_generation,
                old_generation = s.generation,
                "dropping stale poll-cache update"
            );
            return Vec::new();
        }

        s.enabled = true;
        s.events = new_events;
        s.generation = new_generation;
        drop(s);

        self.waiters.wake_matching(new_events)
    }

    /// Registers `world` as interested in `mask`, returning the arena
    /// handle needed for poll-cleanup (spec §4.7 step 5).
    pub fn register(&self, world: WorldId, mask: EventMask) -> generational_arena::Index {
        self.waiters.add(world, mask)
    }

    pub fn unregister(&self, handle: generational_arena::Index) {
        self.waiters.remove(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_is_dropped() {
        let cache = PollCache::new();
        assert_eq!(cache.update(EventMask::READ, 10), Vec::new());
        let (enabled, events, generation) = cache.snapshot();
        assert!(enabled);
        assert_eq!(events, EventMask::READ);
        assert_eq!(generation, 10);

        // Older generation must not mutate events (spec §8 boundary case).
        cache.update(EventMask::WRITE, 9);
        let (_, events, generation) = cache.snapshot();
        assert_eq!(events, EventMask::READ);
        assert_eq!(generation, 10);
    }

    #[test]
    fn newer_generation_wakes_matching_waiters() {
        let cache = PollCache::new();
        cache.register(WorldId(1), EventMask::READ);
        cache.register(WorldId(2), EventMask::WRITE);

        let woken = cache.update(EventMask::READ, 1);
        assert_eq!(woken, vec![WorldId(1)]);
    }

    #[test]
    fn generation_wraps_correctly() {
        let cache = PollCache::new();
        cache.update(EventMask::READ, u32::MAX);
        let woken_like = cache.update(EventMask::WRITE, 0);
        // 0 is "newer" than u32::MAX under wraparound comparison.
        let _ = woken_like;
        let (_, events, generation) = cache.snapshot();
        assert_eq!(events, EventMask::WRITE);
        assert_eq!(generation, 0);
    }
}
