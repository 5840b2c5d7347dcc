//! Waiter lists and poll caches: the two leaf data structures spec'd in
//! `SPEC_FULL.md` §3 ("Waiter list", "Poll cache") that sit underneath the
//! object model. Grounded on the teacher's `gruel::signals` (bitmask-keyed
//! wake) and `gruel::shutdown` (a `generational_arena::Arena` used to hold
//! cancellable registrations, here repurposed to hold waiter nodes instead
//! of shutdown tasks).

pub mod event;
pub mod poll_cache;
pub mod waiter_list;

pub use event::EventMask;
pub use poll_cache::PollCache;
pub use waiter_list::{NotifyList, WaiterList, WorldId};
