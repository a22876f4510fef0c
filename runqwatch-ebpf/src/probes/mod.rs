pub mod builtin;

use aya_ebpf::helpers::{bpf_get_smp_processor_id, bpf_ktime_get_ns, bpf_probe_read_kernel};
use runqwatch_common::{CgroupSource, ReadLock, ReadSection, TaskLayout, TaskSource};

/// Raw `struct task_struct *` taken from a BTF tracepoint argument.
#[derive(Clone, Copy)]
pub struct TaskRef(*const u8);

impl TaskRef {
    #[inline(always)]
    pub fn new(ptr: *const u8) -> Self {
        Self(ptr)
    }
}

#[inline(always)]
fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
    if base.is_null() || offset == 0 {
        return None;
    }
    let ptr = unsafe { base.add(offset as usize) as *const T };
    unsafe { bpf_probe_read_kernel(ptr).ok() }
}

#[inline(always)]
fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr as *const u8)
    }
}

/// Kernel task access through offsets published by user space.
pub struct KernelTasks {
    layout: TaskLayout,
}

impl KernelTasks {
    #[inline(always)]
    pub fn new(layout: TaskLayout) -> Self {
        Self { layout }
    }
}

impl TaskSource for KernelTasks {
    type Task = TaskRef;

    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn cpu_id(&self) -> u32 {
        unsafe { bpf_get_smp_processor_id() }
    }

    #[inline(always)]
    fn task_id(&self, task: &TaskRef) -> Option<u32> {
        read_field::<i32>(task.0, self.layout.task_pid).map(|pid| pid as u32)
    }
}

// BTF tracepoint handlers run inside the dispatcher's RCU read-side
// section, so there is nothing to take here. Every dereference below goes
// through bpf_probe_read_kernel and fails softly.
impl ReadLock for KernelTasks {
    #[inline(always)]
    fn read_lock(&self) {}

    #[inline(always)]
    fn read_unlock(&self) {}
}

impl CgroupSource for KernelTasks {
    /// task->cgroups->dfl_cgrp->kn->id
    #[inline(always)]
    fn default_cgroup_id(&self, task: &TaskRef, _section: &ReadSection<'_, Self>) -> Option<u64> {
        let layout = &self.layout;
        if !layout.has_cgroup_chain() {
            return None;
        }
        let css_set = read_ptr(task.0, layout.task_cgroups)?;
        let cgroup = read_ptr(css_set, layout.css_set_dfl_cgrp)?;
        let kn = read_ptr(cgroup, layout.cgroup_kn)?;
        read_field::<u64>(kn, layout.kernfs_node_id)
    }
}
