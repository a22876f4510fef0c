/// Result of an insert-if-absent into a bounded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An entry already existed and was left untouched.
    AlreadyPresent,
    /// The table is at capacity; nothing was stored.
    Full,
}

/// Fixed-capacity map from task id to the time the task became runnable.
///
/// Shared by all CPUs. A task id is only ever touched by the CPU waking or
/// running that task, so take-after-read is not raced in practice.
pub trait EnqueueTable {
    /// Stores `now_ns` for `task_id` only if no entry exists yet.
    fn record_wakeup(&self, task_id: u32, now_ns: u64) -> InsertOutcome;

    /// Reads and removes the entry for `task_id`.
    fn take_enqueue_time(&self, task_id: u32) -> Option<u64>;
}
