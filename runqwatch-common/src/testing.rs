//! Bounded in-memory doubles for the scheduler host and the BPF maps.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use crate::cgroup::CgroupSource;
use crate::channel::{EventChannel, ReservedSlot};
use crate::host::{ReadLock, ReadSection, TaskSource};
use crate::limiter::CpuLocalStore;
use crate::probe::DropCounter;
use crate::table::{EnqueueTable, InsertOutcome};
use crate::{DropReason, RunqEvent};

/// Host whose tasks are plain pids.
#[derive(Default)]
pub struct FakeHost {
    now: Cell<u64>,
    cpu: Cell<u32>,
    cgroups: RefCell<HashMap<u32, u64>>,
    hidden: RefCell<HashSet<u32>>,
    lock_depth: Cell<i32>,
    sections: Cell<u32>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_now(&self, ts: u64) {
        self.now.set(ts);
    }

    pub fn set_cpu(&self, cpu: u32) {
        self.cpu.set(cpu);
    }

    pub fn set_cgroup(&self, pid: u32, cgroup_id: u64) {
        self.cgroups.borrow_mut().insert(pid, cgroup_id);
    }

    pub fn hide_task(&self, pid: u32) {
        self.hidden.borrow_mut().insert(pid);
    }

    pub fn lock_depth(&self) -> i32 {
        self.lock_depth.get()
    }

    pub fn sections_entered(&self) -> u32 {
        self.sections.get()
    }
}

impl TaskSource for FakeHost {
    type Task = u32;

    fn now_ns(&self) -> u64 {
        self.now.get()
    }

    fn cpu_id(&self) -> u32 {
        self.cpu.get()
    }

    fn task_id(&self, task: &u32) -> Option<u32> {
        (!self.hidden.borrow().contains(task)).then_some(*task)
    }
}

impl ReadLock for FakeHost {
    fn read_lock(&self) {
        self.lock_depth.set(self.lock_depth.get() + 1);
        self.sections.set(self.sections.get() + 1);
    }

    fn read_unlock(&self) {
        assert!(self.lock_depth.get() > 0, "unbalanced read_unlock");
        self.lock_depth.set(self.lock_depth.get() - 1);
    }
}

impl CgroupSource for FakeHost {
    fn default_cgroup_id(&self, task: &u32, _section: &ReadSection<'_, Self>) -> Option<u64> {
        assert!(self.lock_depth.get() > 0, "cgroup read outside read section");
        self.cgroups.borrow().get(task).copied()
    }
}

/// Insert-if-absent table that refuses inserts beyond `capacity`.
pub struct BoundedTable {
    capacity: usize,
    entries: RefCell<HashMap<u32, u64>>,
}

impl BoundedTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RefCell::new(HashMap::new()),
        }
    }
}

impl EnqueueTable for BoundedTable {
    fn record_wakeup(&self, task_id: u32, now_ns: u64) -> InsertOutcome {
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(&task_id) {
            return InsertOutcome::AlreadyPresent;
        }
        if entries.len() >= self.capacity {
            return InsertOutcome::Full;
        }
        entries.insert(task_id, now_ns);
        InsertOutcome::Inserted
    }

    fn take_enqueue_time(&self, task_id: u32) -> Option<u64> {
        self.entries.borrow_mut().remove(&task_id)
    }
}

/// One bounded map per CPU.
pub struct PartitionedStore {
    capacity: usize,
    shards: Vec<RefCell<HashMap<u64, u64>>>,
}

impl PartitionedStore {
    pub fn new(cpus: usize, capacity: usize) -> Self {
        Self {
            capacity,
            shards: (0..cpus).map(|_| RefCell::new(HashMap::new())).collect(),
        }
    }
}

impl CpuLocalStore for PartitionedStore {
    fn last_emit(&self, cpu: u32, cgroup_id: u64) -> Option<u64> {
        self.shards[cpu as usize].borrow().get(&cgroup_id).copied()
    }

    fn set_last_emit(&self, cpu: u32, cgroup_id: u64, now_ns: u64) -> bool {
        let mut shard = self.shards[cpu as usize].borrow_mut();
        if !shard.contains_key(&cgroup_id) && shard.len() >= self.capacity {
            return false;
        }
        shard.insert(cgroup_id, now_ns);
        true
    }
}

/// Channel holding at most `capacity` published plus reserved events.
pub struct VecChannel {
    capacity: usize,
    reserved: Cell<usize>,
    events: RefCell<Vec<RunqEvent>>,
}

impl VecChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            reserved: Cell::new(0),
            events: RefCell::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<RunqEvent> {
        self.events.borrow().clone()
    }
}

pub struct VecSlot<'a> {
    channel: &'a VecChannel,
}

impl EventChannel for VecChannel {
    type Slot<'a> = VecSlot<'a>;

    fn try_reserve(&self) -> Option<VecSlot<'_>> {
        if self.events.borrow().len() + self.reserved.get() >= self.capacity {
            return None;
        }
        self.reserved.set(self.reserved.get() + 1);
        Some(VecSlot { channel: self })
    }
}

impl ReservedSlot for VecSlot<'_> {
    fn publish(self, event: RunqEvent) {
        self.channel.reserved.set(self.channel.reserved.get() - 1);
        self.channel.events.borrow_mut().push(event);
    }
}

#[derive(Default)]
pub struct CountingDrops {
    counts: [Cell<u64>; DropReason::COUNT as usize],
}

impl CountingDrops {
    pub fn count(&self, reason: DropReason) -> u64 {
        self.counts[reason.index() as usize].get()
    }
}

impl DropCounter for CountingDrops {
    fn record_drop(&self, reason: DropReason) {
        let cell = &self.counts[reason.index() as usize];
        cell.set(cell.get() + 1);
    }
}
