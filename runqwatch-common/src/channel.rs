use crate::RunqEvent;

/// Bounded, non-blocking event channel towards user space.
pub trait EventChannel {
    type Slot<'a>: ReservedSlot
    where
        Self: 'a;

    /// Reserves room for one event. `None` when the channel is full; the
    /// caller drops the sample and never retries.
    fn try_reserve(&self) -> Option<Self::Slot<'_>>;
}

/// Reserved, not yet visible space for one event.
pub trait ReservedSlot {
    /// Fills the slot and makes it visible to readers.
    fn publish(self, event: RunqEvent);
}
