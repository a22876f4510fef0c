use crate::UNKNOWN_CGROUP_ID;
use crate::host::{ReadLock, ReadSection, TaskSource};

/// Access to a task's default (unified hierarchy) cgroup.
pub trait CgroupSource: TaskSource + ReadLock {
    /// Reads the id of the task's default cgroup leaf.
    ///
    /// Only callable while `section` is held.
    fn default_cgroup_id(&self, task: &Self::Task, section: &ReadSection<'_, Self>) -> Option<u64>;
}

/// Resolves the default cgroup id of `task`, freshly on every call.
///
/// Tasks without a readable cgroup (the idle task, exiting tasks, an
/// unknown structure layout) resolve to [`UNKNOWN_CGROUP_ID`].
#[inline(always)]
pub fn resolve_cgroup_id<S: CgroupSource + ?Sized>(source: &S, task: &S::Task) -> u64 {
    let section = ReadSection::enter(source);
    source
        .default_cgroup_id(task, &section)
        .unwrap_or(UNKNOWN_CGROUP_ID)
}
