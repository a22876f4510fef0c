/// Fixed-capacity map from cgroup id to last emission time, one independent
/// partition per CPU.
///
/// Implementations index their partition with `cpu`; a host whose storage
/// is already CPU-local (a per-CPU BPF map) may ignore it.
pub trait CpuLocalStore {
    fn last_emit(&self, cpu: u32, cgroup_id: u64) -> Option<u64>;

    /// Overwrites the last emission time. Returns false if the partition is
    /// full and the cgroup had no entry yet.
    fn set_last_emit(&self, cpu: u32, cgroup_id: u64, now_ns: u64) -> bool;
}

/// Per-cgroup-per-CPU rate limiter.
///
/// A cgroup may emit at most once per window on each CPU. The window only
/// restarts on [`RateLimiter::mark_emitted`], never on a suppressed check.
pub struct RateLimiter<S> {
    store: S,
    window_ns: u64,
}

impl<S> RateLimiter<S> {
    pub const fn new(store: S, window_ns: u64) -> Self {
        Self { store, window_ns }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: CpuLocalStore> RateLimiter<S> {
    /// True if `cgroup_id` may emit on `cpu` at `now_ns`.
    ///
    /// A timestamp earlier than the stored one counts as inside the window,
    /// which keeps the stored value non-decreasing.
    #[inline(always)]
    pub fn should_emit(&self, cgroup_id: u64, now_ns: u64, cpu: u32) -> bool {
        match self.store.last_emit(cpu, cgroup_id) {
            Some(last) => now_ns.saturating_sub(last) >= self.window_ns,
            None => true,
        }
    }

    #[inline(always)]
    pub fn mark_emitted(&self, cgroup_id: u64, now_ns: u64, cpu: u32) {
        // A full partition just leaves this cgroup unlimited on this CPU.
        let _ = self.store.set_last_emit(cpu, cgroup_id, now_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PartitionedStore;

    const WINDOW: u64 = 1_000;

    fn limiter() -> RateLimiter<PartitionedStore> {
        RateLimiter::new(PartitionedStore::new(2, 16), WINDOW)
    }

    #[test]
    fn test_first_event_always_passes() {
        let limiter = limiter();
        assert!(limiter.should_emit(7, 5, 0));
    }

    #[test]
    fn test_window_boundary() {
        let limiter = limiter();
        limiter.mark_emitted(7, 10_000, 0);

        assert!(!limiter.should_emit(7, 10_000 + WINDOW - 1, 0));
        assert!(limiter.should_emit(7, 10_000 + WINDOW, 0));
    }

    #[test]
    fn test_suppressed_check_does_not_reset_window() {
        let limiter = limiter();
        limiter.mark_emitted(7, 10_000, 0);

        assert!(!limiter.should_emit(7, 10_500, 0));
        assert!(!limiter.should_emit(7, 10_900, 0));
        assert!(limiter.should_emit(7, 11_000, 0));
    }

    #[test]
    fn test_partitions_are_independent() {
        let limiter = limiter();
        limiter.mark_emitted(7, 10_000, 0);

        assert!(!limiter.should_emit(7, 10_100, 0));
        assert!(limiter.should_emit(7, 10_100, 1));
    }

    #[test]
    fn test_clock_going_backwards_is_suppressed() {
        let limiter = limiter();
        limiter.mark_emitted(7, 10_000, 0);

        assert!(!limiter.should_emit(7, 9_000, 0));
        assert_eq!(limiter.store().last_emit(0, 7), Some(10_000));
    }

    #[test]
    fn test_full_partition_leaves_new_cgroups_unlimited() {
        let limiter = RateLimiter::new(PartitionedStore::new(1, 1), WINDOW);
        limiter.mark_emitted(1, 10_000, 0);
        limiter.mark_emitted(2, 10_000, 0);

        assert!(!limiter.should_emit(1, 10_001, 0));
        assert!(limiter.should_emit(2, 10_001, 0));
    }
}
