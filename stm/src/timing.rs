use crate::error::AbortReason;

/// Points in a thread's life reported to the timing callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingEvent {
    TransactionStart,
    Commit { rev: u64 },
    Abort { reason: AbortReason },
    BecomeInevitable,
    WaitInevitableStart,
    WaitInevitableDone,
    MinorGcStart,
    MinorGcDone { promoted_bytes: usize },
    MajorGcStart,
    MajorGcDone { freed_bytes: usize },
}

/// Called with the segment number of the reporting thread.
pub type TimingCallback = dyn Fn(usize, TimingEvent) + Send + Sync;

/// Per-thread counters, reset when the thread registers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStats {
    pub commits: u64,
    pub aborts: u64,
    pub inevitable_transactions: u64,
    pub minor_collections: u64,
    pub promoted_bytes: u64,
    pub pages_imported: u64,
}

/// Snapshot of engine-wide state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StmStats {
    pub latest_rev: u64,
    pub commit_log_len: usize,
    pub old_allocated_bytes: usize,
    pub old_usage: f64,
    pub major_collections: u64,
    pub registered_threads: usize,
}
