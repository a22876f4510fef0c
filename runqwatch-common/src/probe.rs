//! Run queue latency probe: ties the enqueue table, cgroup resolver, rate
//! limiter and event channel together on the two scheduling events.
//!
//! Every path is bounded and allocation free. Each way a sample can be lost
//! is a normal branch that returns an outcome, never an error.

use crate::cgroup::{CgroupSource, resolve_cgroup_id};
use crate::channel::{EventChannel, ReservedSlot};
use crate::limiter::{CpuLocalStore, RateLimiter};
use crate::table::{EnqueueTable, InsertOutcome};
use crate::{DropReason, RunqEvent};

/// Callbacks a scheduler host invokes synchronously.
pub trait EventHook<T: ?Sized> {
    /// `task` became runnable.
    fn on_wakeup(&self, task: &T) -> WakeupOutcome;

    /// `prev` is switched out and `next` switched in on the current CPU.
    fn on_switch(&self, prev: &T, next: &T) -> SwitchOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupOutcome {
    Recorded,
    /// The task already had a pending wakeup; its timestamp was kept.
    AlreadyEnqueued,
    TableFull,
    /// The task id could not be read.
    Unidentified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Emitted(RunqEvent),
    MissedEnqueue,
    RateLimited,
    ChannelFull,
}

impl SwitchOutcome {
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            SwitchOutcome::Emitted(_) => None,
            SwitchOutcome::MissedEnqueue => Some(DropReason::MissedEnqueue),
            SwitchOutcome::RateLimited => Some(DropReason::RateLimited),
            SwitchOutcome::ChannelFull => Some(DropReason::ChannelFull),
        }
    }
}

/// Sink for dropped-sample accounting.
pub trait DropCounter {
    fn record_drop(&self, reason: DropReason);
}

impl DropCounter for () {
    #[inline(always)]
    fn record_drop(&self, _reason: DropReason) {}
}

pub struct RunqLatencyProbe<H, E, L, C, D = ()> {
    host: H,
    enqueued: E,
    limiter: RateLimiter<L>,
    channel: C,
    drops: D,
}

impl<H, E, L, C, D> RunqLatencyProbe<H, E, L, C, D> {
    pub const fn new(host: H, enqueued: E, limiter: RateLimiter<L>, channel: C, drops: D) -> Self {
        Self {
            host,
            enqueued,
            limiter,
            channel,
            drops,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn enqueued(&self) -> &E {
        &self.enqueued
    }

    pub fn limiter(&self) -> &RateLimiter<L> {
        &self.limiter
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn drops(&self) -> &D {
        &self.drops
    }
}

impl<H, E, L, C, D> RunqLatencyProbe<H, E, L, C, D>
where
    H: CgroupSource,
    E: EnqueueTable,
    L: CpuLocalStore,
    C: EventChannel,
    D: DropCounter,
{
    #[inline(always)]
    fn dropped(&self, outcome: SwitchOutcome) -> SwitchOutcome {
        if let Some(reason) = outcome.drop_reason() {
            self.drops.record_drop(reason);
        }
        outcome
    }
}

impl<H, E, L, C, D> EventHook<H::Task> for RunqLatencyProbe<H, E, L, C, D>
where
    H: CgroupSource,
    E: EnqueueTable,
    L: CpuLocalStore,
    C: EventChannel,
    D: DropCounter,
{
    #[inline(always)]
    fn on_wakeup(&self, task: &H::Task) -> WakeupOutcome {
        let Some(task_id) = self.host.task_id(task) else {
            return WakeupOutcome::Unidentified;
        };

        match self.enqueued.record_wakeup(task_id, self.host.now_ns()) {
            InsertOutcome::Inserted => WakeupOutcome::Recorded,
            InsertOutcome::AlreadyPresent => WakeupOutcome::AlreadyEnqueued,
            InsertOutcome::Full => {
                self.drops.record_drop(DropReason::TableFull);
                WakeupOutcome::TableFull
            }
        }
    }

    #[inline(always)]
    fn on_switch(&self, prev: &H::Task, next: &H::Task) -> SwitchOutcome {
        let enqueued_ns = match self
            .host
            .task_id(next)
            .and_then(|id| self.enqueued.take_enqueue_time(id))
        {
            Some(ts) => ts,
            None => return self.dropped(SwitchOutcome::MissedEnqueue),
        };

        let now = self.host.now_ns();
        // Plain wrapping subtraction: a clock anomaly shows up as a huge
        // value that consumers bound, never as a fabricated zero.
        let runq_lat_ns = now.wrapping_sub(enqueued_ns);

        let prev_cgroup_id = resolve_cgroup_id(&self.host, prev);
        let cgroup_id = resolve_cgroup_id(&self.host, next);

        let cpu = self.host.cpu_id();
        if !self.limiter.should_emit(cgroup_id, now, cpu) {
            return self.dropped(SwitchOutcome::RateLimited);
        }

        let Some(slot) = self.channel.try_reserve() else {
            return self.dropped(SwitchOutcome::ChannelFull);
        };

        let event = RunqEvent {
            prev_cgroup_id,
            cgroup_id,
            runq_lat_ns,
            ts_ns: now,
        };
        slot.publish(event);
        self.limiter.mark_emitted(cgroup_id, now, cpu);

        SwitchOutcome::Emitted(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UNKNOWN_CGROUP_ID;
    use crate::testing::{BoundedTable, CountingDrops, FakeHost, PartitionedStore, VecChannel};

    const WINDOW: u64 = 10_000_000;
    const CGROUP_A: u64 = 0xA;
    const CGROUP_B: u64 = 0xB;

    type TestProbe = RunqLatencyProbe<FakeHost, BoundedTable, PartitionedStore, VecChannel, CountingDrops>;

    fn probe_with(table_cap: usize, channel_cap: usize) -> TestProbe {
        RunqLatencyProbe::new(
            FakeHost::new(),
            BoundedTable::new(table_cap),
            RateLimiter::new(PartitionedStore::new(4, 64), WINDOW),
            VecChannel::new(channel_cap),
            CountingDrops::default(),
        )
    }

    fn probe() -> TestProbe {
        probe_with(64, 64)
    }

    fn wakeup_at(probe: &TestProbe, pid: u32, ts: u64) -> WakeupOutcome {
        probe.host().set_now(ts);
        probe.on_wakeup(&pid)
    }

    fn switch_at(probe: &TestProbe, prev: u32, next: u32, ts: u64) -> SwitchOutcome {
        probe.host().set_now(ts);
        probe.on_switch(&prev, &next)
    }

    #[test]
    fn test_end_to_end_single_event() {
        let probe = probe();
        probe.host().set_cpu(0);
        probe.host().set_cgroup(3, CGROUP_A);
        probe.host().set_cgroup(5, CGROUP_B);

        assert_eq!(wakeup_at(&probe, 5, 100), WakeupOutcome::Recorded);
        let outcome = switch_at(&probe, 3, 5, 150);

        let expected = RunqEvent {
            prev_cgroup_id: CGROUP_A,
            cgroup_id: CGROUP_B,
            runq_lat_ns: 50,
            ts_ns: 150,
        };
        assert_eq!(outcome, SwitchOutcome::Emitted(expected));
        assert_eq!(probe.channel().published(), vec![expected]);
        assert_eq!(probe.host().lock_depth(), 0);
    }

    #[test]
    fn test_latency_is_exact_difference() {
        let probe = probe();
        probe.host().set_cgroup(9, CGROUP_B);

        wakeup_at(&probe, 9, 1_000_000_007);
        match switch_at(&probe, 1, 9, 1_003_500_011) {
            SwitchOutcome::Emitted(event) => assert_eq!(event.runq_lat_ns, 3_500_004),
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_wakeup_keeps_first_timestamp() {
        let probe = probe();
        probe.host().set_cgroup(5, CGROUP_B);

        assert_eq!(wakeup_at(&probe, 5, 100), WakeupOutcome::Recorded);
        assert_eq!(wakeup_at(&probe, 5, 130), WakeupOutcome::AlreadyEnqueued);

        match switch_at(&probe, 3, 5, 150) {
            SwitchOutcome::Emitted(event) => assert_eq!(event.runq_lat_ns, 50),
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_switch_without_wakeup_is_silent() {
        let probe = probe();

        assert_eq!(switch_at(&probe, 3, 5, 150), SwitchOutcome::MissedEnqueue);
        assert!(probe.channel().published().is_empty());
        assert_eq!(probe.drops().count(DropReason::MissedEnqueue), 1);
        // No cgroup lookup happens on the early return.
        assert_eq!(probe.host().sections_entered(), 0);
    }

    #[test]
    fn test_enqueue_record_consumed_once() {
        let probe = probe();
        wakeup_at(&probe, 5, 100);

        assert!(matches!(switch_at(&probe, 3, 5, 150), SwitchOutcome::Emitted(_)));
        // Preempted and switched back in without a new wakeup.
        assert_eq!(switch_at(&probe, 3, 5, 50_000_000), SwitchOutcome::MissedEnqueue);
        assert_eq!(probe.channel().published().len(), 1);
    }

    #[test]
    fn test_rate_limit_same_cgroup_same_cpu() {
        let probe = probe();
        probe.host().set_cgroup(5, CGROUP_B);
        probe.host().set_cgroup(6, CGROUP_B);
        probe.host().set_cgroup(7, CGROUP_B);

        wakeup_at(&probe, 5, 1_000);
        assert!(matches!(switch_at(&probe, 1, 5, 2_000), SwitchOutcome::Emitted(_)));

        // d < W: suppressed.
        wakeup_at(&probe, 6, 2_100);
        assert_eq!(
            switch_at(&probe, 1, 6, 2_000 + WINDOW - 1),
            SwitchOutcome::RateLimited
        );

        // d >= W from the last emission: emitted.
        wakeup_at(&probe, 7, 2_000 + WINDOW - 1);
        assert!(matches!(
            switch_at(&probe, 1, 7, 2_000 + WINDOW),
            SwitchOutcome::Emitted(_)
        ));

        assert_eq!(probe.channel().published().len(), 2);
        assert_eq!(probe.drops().count(DropReason::RateLimited), 1);
    }

    #[test]
    fn test_rate_limited_sample_still_consumes_enqueue_record() {
        let probe = probe();
        probe.host().set_cgroup(5, CGROUP_B);
        probe.host().set_cgroup(6, CGROUP_B);

        wakeup_at(&probe, 5, 1_000);
        switch_at(&probe, 1, 5, 2_000);
        wakeup_at(&probe, 6, 2_100);
        assert_eq!(switch_at(&probe, 1, 6, 3_000), SwitchOutcome::RateLimited);

        assert_eq!(probe.enqueued().take_enqueue_time(6), None);
    }

    #[test]
    fn test_rate_limit_is_per_cpu() {
        let probe = probe();
        probe.host().set_cgroup(5, CGROUP_B);
        probe.host().set_cgroup(6, CGROUP_B);

        probe.host().set_cpu(0);
        wakeup_at(&probe, 5, 1_000);
        assert!(matches!(switch_at(&probe, 1, 5, 2_000), SwitchOutcome::Emitted(_)));

        probe.host().set_cpu(1);
        wakeup_at(&probe, 6, 1_500);
        assert!(matches!(switch_at(&probe, 2, 6, 2_500), SwitchOutcome::Emitted(_)));

        assert_eq!(probe.channel().published().len(), 2);
    }

    #[test]
    fn test_rate_limit_keyed_by_next_cgroup() {
        let probe = probe();
        probe.host().set_cgroup(1, CGROUP_A);
        probe.host().set_cgroup(5, CGROUP_B);
        probe.host().set_cgroup(6, CGROUP_A);

        wakeup_at(&probe, 5, 1_000);
        assert!(matches!(switch_at(&probe, 1, 5, 2_000), SwitchOutcome::Emitted(_)));

        // Prev cgroup B just emitted, next cgroup A has not.
        wakeup_at(&probe, 6, 2_100);
        assert!(matches!(switch_at(&probe, 5, 6, 2_200), SwitchOutcome::Emitted(_)));
    }

    #[test]
    fn test_channel_full_drops_without_arming_limiter() {
        let probe = probe_with(64, 0);
        probe.host().set_cgroup(5, CGROUP_B);

        wakeup_at(&probe, 5, 1_000);
        assert_eq!(switch_at(&probe, 1, 5, 2_000), SwitchOutcome::ChannelFull);
        assert_eq!(probe.drops().count(DropReason::ChannelFull), 1);
        assert_eq!(probe.limiter().store().last_emit(0, CGROUP_B), None);
        assert_eq!(probe.host().lock_depth(), 0);
    }

    #[test]
    fn test_table_full_loses_sample() {
        let probe = probe_with(1, 64);

        assert_eq!(wakeup_at(&probe, 5, 100), WakeupOutcome::Recorded);
        assert_eq!(wakeup_at(&probe, 6, 110), WakeupOutcome::TableFull);
        assert_eq!(probe.drops().count(DropReason::TableFull), 1);

        // The lost wakeup is never reported as a zero latency.
        assert_eq!(switch_at(&probe, 1, 6, 200), SwitchOutcome::MissedEnqueue);
        assert!(matches!(switch_at(&probe, 1, 5, 300), SwitchOutcome::Emitted(_)));
    }

    #[test]
    fn test_idle_prev_resolves_to_sentinel() {
        let probe = probe();
        probe.host().set_cgroup(5, CGROUP_B);

        wakeup_at(&probe, 5, 100);
        match switch_at(&probe, 0, 5, 150) {
            SwitchOutcome::Emitted(event) => {
                assert_eq!(event.prev_cgroup_id, UNKNOWN_CGROUP_ID);
                assert_eq!(event.cgroup_id, CGROUP_B);
            }
            other => panic!("expected an event, got {:?}", other),
        }
        assert_eq!(probe.host().sections_entered(), 2);
        assert_eq!(probe.host().lock_depth(), 0);
    }

    #[test]
    fn test_clock_anomaly_wraps() {
        let probe = probe();
        probe.host().set_cgroup(5, CGROUP_B);

        wakeup_at(&probe, 5, 200);
        match switch_at(&probe, 1, 5, 150) {
            SwitchOutcome::Emitted(event) => assert_eq!(event.runq_lat_ns, u64::MAX - 49),
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_unidentified_task_is_not_tracked() {
        let probe = probe();
        probe.host().hide_task(5);

        assert_eq!(wakeup_at(&probe, 5, 100), WakeupOutcome::Unidentified);
        assert_eq!(switch_at(&probe, 1, 5, 150), SwitchOutcome::MissedEnqueue);
    }
}
