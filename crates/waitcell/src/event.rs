use bitflags::bitflags;

bitflags! {
    /// Readiness bits used by both `poll()` dispatch (spec §4.7) and the
    /// proxy's poll-cache piggyback updates (spec §4.5). Mirrors the
    /// `poll(2)`-shaped events a proxied handle can report, trimmed to what
    /// this subsystem actually distinguishes.
    #[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Default)]
    pub struct EventMask: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const RD_HUP  = 1 << 2;
        const WR_HUP  = 1 << 3;
        const INVALID = 1 << 4;
        const ERROR   = 1 << 5;
    }
}

impl EventMask {
    /// Bits that, once asserted, wake *every* waiter on a list regardless
    /// of the mask they registered with (spec §4.5: "an error-mask bit ...
    /// wakes all waiters irrespective of their mask").
    pub const ERROR_BITS: EventMask = EventMask::RD_HUP
        .union(EventMask::WR_HUP)
        .union(EventMask::INVALID)
        .union(EventMask::ERROR);

    pub fn is_error(self) -> bool {
        self.intersects(Self::ERROR_BITS)
    }
}
