//! Services the scheduler host provides to the probe on every callback.

/// Clock, CPU and task identity of the calling context.
pub trait TaskSource {
    /// Opaque handle to a task, as delivered by the scheduling event.
    type Task: ?Sized;

    /// Monotonic timestamp in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Index of the CPU running the callback.
    fn cpu_id(&self) -> u32;

    /// Stable identifier of a live task, `None` if it cannot be read.
    fn task_id(&self, task: &Self::Task) -> Option<u32>;
}

/// Read-side critical section protecting the task -> cgroup pointer chain.
pub trait ReadLock {
    fn read_lock(&self);
    fn read_unlock(&self);
}

/// Scoped read access: the lock is taken on [`ReadSection::enter`] and
/// released when the guard drops, on every exit path.
#[must_use]
pub struct ReadSection<'a, L: ReadLock + ?Sized> {
    lock: &'a L,
}

impl<'a, L: ReadLock + ?Sized> ReadSection<'a, L> {
    #[inline(always)]
    pub fn enter(lock: &'a L) -> Self {
        lock.read_lock();
        Self { lock }
    }
}

impl<L: ReadLock + ?Sized> Drop for ReadSection<'_, L> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}
