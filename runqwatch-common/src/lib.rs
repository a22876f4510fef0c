#![cfg_attr(not(test), no_std)]

pub mod cgroup;
pub mod channel;
pub mod host;
pub mod limiter;
pub mod probe;
pub mod table;

#[cfg(test)]
mod testing;

pub use cgroup::{CgroupSource, resolve_cgroup_id};
pub use channel::{EventChannel, ReservedSlot};
pub use host::{ReadLock, ReadSection, TaskSource};
pub use limiter::{CpuLocalStore, RateLimiter};
pub use probe::{DropCounter, EventHook, RunqLatencyProbe, SwitchOutcome, WakeupOutcome};
pub use table::{EnqueueTable, InsertOutcome};

/// Maximum number of tasks with a pending wakeup, and of cgroups tracked per
/// CPU by the rate limiter.
pub const MAX_TASK_ENTRIES: u32 = 10240;

/// Capacity of the run queue event ring buffer.
pub const RINGBUF_SIZE_BYTES: u32 = 256 * 1024;

/// Default minimum spacing between two events of one cgroup on one CPU (10ms).
pub const DEFAULT_RATE_LIMIT_NS: u64 = 10_000_000;

/// Cgroup id reported when a task's cgroup cannot be read.
pub const UNKNOWN_CGROUP_ID: u64 = 0;

/// Run queue latency sample, as written to the `RUNQ_EVENTS` ring buffer.
///
/// The layout is the wire contract with user space: four native-endian u64
/// fields, 32 bytes, in this order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunqEvent {
    /// Cgroup of the task that was switched out.
    pub prev_cgroup_id: u64,
    /// Cgroup of the task that waited on the run queue.
    pub cgroup_id: u64,
    pub runq_lat_ns: u64,
    /// Monotonic timestamp of the context switch.
    pub ts_ns: u64,
}

const _: () = assert!(core::mem::size_of::<RunqEvent>() == 32);

/// Runtime configuration published by user space in `RUNQ_CONFIG[0]`.
///
/// The probe stays inactive while `enabled` is zero, so nothing is recorded
/// before user space has also published the task layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub rate_limit_ns: u64,
    pub enabled: u8,
    pub _pad: [u8; 7],
}

impl ProbeConfig {
    pub const fn new(rate_limit_ns: u64) -> Self {
        Self {
            rate_limit_ns,
            enabled: 1,
            _pad: [0; 7],
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_NS)
    }
}

/// Byte offsets of the kernel structure members the probe dereferences.
///
/// Chain: `task_struct.pid`, `task_struct.cgroups -> css_set.dfl_cgrp ->
/// cgroup.kn -> kernfs_node.id`. None of these members sits at offset 0 in
/// any kernel, so 0 means "unknown".
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskLayout {
    pub task_pid: u32,
    pub task_cgroups: u32,
    pub css_set_dfl_cgrp: u32,
    pub cgroup_kn: u32,
    pub kernfs_node_id: u32,
    pub _pad: u32,
}

impl TaskLayout {
    pub const fn zeroed() -> Self {
        Self {
            task_pid: 0,
            task_cgroups: 0,
            css_set_dfl_cgrp: 0,
            cgroup_kn: 0,
            kernfs_node_id: 0,
            _pad: 0,
        }
    }

    pub const fn has_pid(&self) -> bool {
        self.task_pid != 0
    }

    pub const fn has_cgroup_chain(&self) -> bool {
        self.task_cgroups != 0
            && self.css_set_dfl_cgrp != 0
            && self.cgroup_kn != 0
            && self.kernfs_node_id != 0
    }
}

/// Why a latency sample was not published. Indexes `RUNQ_DROPS`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Switch-in without a recorded wakeup.
    MissedEnqueue = 0,
    /// Wakeup could not be recorded, the enqueue table was full.
    TableFull = 1,
    RateLimited = 2,
    /// Ring buffer reservation failed.
    ChannelFull = 3,
}

impl DropReason {
    pub const COUNT: u32 = 4;

    pub const ALL: [DropReason; Self::COUNT as usize] = [
        DropReason::MissedEnqueue,
        DropReason::TableFull,
        DropReason::RateLimited,
        DropReason::ChannelFull,
    ];

    pub const fn index(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            DropReason::MissedEnqueue => "missed_enqueue",
            DropReason::TableFull => "table_full",
            DropReason::RateLimited => "rate_limited",
            DropReason::ChannelFull => "channel_full",
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RunqEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ProbeConfig {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TaskLayout {}
