//! Run queue latency per cgroup ("noisy neighbour" detection).
//!
//! `sched_wakeup`/`sched_wakeup_new` record when a task became runnable,
//! `sched_switch` turns that into a latency sample for the task switched in
//! and publishes it, rate limited per cgroup and CPU, to `RUNQ_EVENTS`.

use aya_ebpf::{
    bindings::{BPF_ANY, BPF_NOEXIST},
    macros::{btf_tracepoint, map},
    maps::{Array, HashMap, PerCpuArray, PerCpuHashMap, RingBuf, ring_buf::RingBufEntry},
    programs::BtfTracePointContext,
};
use aya_log_ebpf::debug;
use runqwatch_common::{
    CpuLocalStore, DropCounter, DropReason, EnqueueTable, EventChannel, EventHook, InsertOutcome,
    MAX_TASK_ENTRIES, ProbeConfig, RINGBUF_SIZE_BYTES, RateLimiter, ReservedSlot,
    RunqLatencyProbe, RunqEvent, SwitchOutcome, TaskLayout, WakeupOutcome,
};

use crate::probes::{KernelTasks, TaskRef};

const EEXIST: i64 = 17;

#[map]
pub static RUNQ_EVENTS: RingBuf = RingBuf::with_byte_size(RINGBUF_SIZE_BYTES, 0);

/// pid -> ktime of the wakeup that made it runnable.
#[map]
static RUNQ_ENQUEUED: HashMap<u32, u64> = HashMap::with_max_entries(MAX_TASK_ENTRIES, 0);

/// cgroup id -> ktime of the last published event, per CPU.
#[map]
static CGROUP_LAST_EVENT_TS: PerCpuHashMap<u64, u64> =
    PerCpuHashMap::with_max_entries(MAX_TASK_ENTRIES, 0);

#[map]
pub static RUNQ_CONFIG: Array<ProbeConfig> = Array::with_max_entries(1, 0);

#[map]
pub static TASK_LAYOUT: Array<TaskLayout> = Array::with_max_entries(1, 0);

/// Dropped samples per `DropReason`, per CPU.
#[map]
pub static RUNQ_DROPS: PerCpuArray<u64> = PerCpuArray::with_max_entries(DropReason::COUNT, 0);

struct EnqueuedTasks;

impl EnqueueTable for EnqueuedTasks {
    #[inline(always)]
    fn record_wakeup(&self, task_id: u32, now_ns: u64) -> InsertOutcome {
        match RUNQ_ENQUEUED.insert(&task_id, &now_ns, BPF_NOEXIST as u64) {
            Ok(()) => InsertOutcome::Inserted,
            Err(e) if e == -EEXIST => InsertOutcome::AlreadyPresent,
            Err(_) => InsertOutcome::Full,
        }
    }

    #[inline(always)]
    fn take_enqueue_time(&self, task_id: u32) -> Option<u64> {
        let ts = unsafe { RUNQ_ENQUEUED.get(&task_id) }.copied()?;
        // Only fails if a concurrent switch already took this pid.
        let _ = RUNQ_ENQUEUED.remove(&task_id);
        Some(ts)
    }
}

/// Backed by a per-CPU map: the kernel already selects the current CPU's
/// partition, so `cpu` is unused.
struct CgroupLastEventTs;

impl CpuLocalStore for CgroupLastEventTs {
    #[inline(always)]
    fn last_emit(&self, _cpu: u32, cgroup_id: u64) -> Option<u64> {
        unsafe { CGROUP_LAST_EVENT_TS.get(&cgroup_id) }.copied()
    }

    #[inline(always)]
    fn set_last_emit(&self, _cpu: u32, cgroup_id: u64, now_ns: u64) -> bool {
        CGROUP_LAST_EVENT_TS
            .insert(&cgroup_id, &now_ns, BPF_ANY as u64)
            .is_ok()
    }
}

struct RunqEvents;

struct RunqSlot(RingBufEntry<RunqEvent>);

impl EventChannel for RunqEvents {
    type Slot<'a> = RunqSlot;

    #[inline(always)]
    fn try_reserve(&self) -> Option<RunqSlot> {
        RUNQ_EVENTS.reserve::<RunqEvent>(0).map(RunqSlot)
    }
}

impl ReservedSlot for RunqSlot {
    #[inline(always)]
    fn publish(mut self, event: RunqEvent) {
        self.0.write(event);
        self.0.submit(0);
    }
}

struct RunqDrops;

impl DropCounter for RunqDrops {
    #[inline(always)]
    fn record_drop(&self, reason: DropReason) {
        if let Some(count) = RUNQ_DROPS.get_ptr_mut(reason.index()) {
            unsafe { *count += 1 };
        }
    }
}

type KernelProbe =
    RunqLatencyProbe<KernelTasks, EnqueuedTasks, CgroupLastEventTs, RunqEvents, RunqDrops>;

/// Builds the probe from the published configuration. `None` until user
/// space has enabled the probe and a pid offset is known.
#[inline(always)]
fn kernel_probe() -> Option<KernelProbe> {
    let config = *RUNQ_CONFIG.get(0)?;
    if !config.is_enabled() {
        return None;
    }
    let layout = *TASK_LAYOUT.get(0)?;
    if !layout.has_pid() {
        return None;
    }

    Some(RunqLatencyProbe::new(
        KernelTasks::new(layout),
        EnqueuedTasks,
        RateLimiter::new(CgroupLastEventTs, config.rate_limit_ns),
        RunqEvents,
        RunqDrops,
    ))
}

/// sched_wakeup(struct task_struct *p)
#[btf_tracepoint(function = "sched_wakeup")]
pub fn runq_sched_wakeup(ctx: BtfTracePointContext) -> i32 {
    try_wakeup(&ctx)
}

/// sched_wakeup_new(struct task_struct *p)
#[btf_tracepoint(function = "sched_wakeup_new")]
pub fn runq_sched_wakeup_new(ctx: BtfTracePointContext) -> i32 {
    try_wakeup(&ctx)
}

/// sched_switch(bool preempt, struct task_struct *prev,
///              struct task_struct *next, unsigned int prev_state)
#[btf_tracepoint(function = "sched_switch")]
pub fn runq_sched_switch(ctx: BtfTracePointContext) -> i32 {
    let Some(probe) = kernel_probe() else {
        return 0;
    };

    let prev = TaskRef::new(unsafe { ctx.arg(1) });
    let next = TaskRef::new(unsafe { ctx.arg(2) });

    if let SwitchOutcome::ChannelFull = probe.on_switch(&prev, &next) {
        debug!(&ctx, "runq sample dropped: RUNQ_EVENTS full");
    }
    0
}

#[inline(always)]
fn try_wakeup(ctx: &BtfTracePointContext) -> i32 {
    let Some(probe) = kernel_probe() else {
        return 0;
    };

    let task = TaskRef::new(unsafe { ctx.arg(0) });
    if let WakeupOutcome::TableFull = probe.on_wakeup(&task) {
        debug!(ctx, "runq wakeup dropped: RUNQ_ENQUEUED full");
    }
    0
}
