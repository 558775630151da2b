use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use object::ObjRef;
use parking_lot::{MutexGuard, RwLock};

/// Proof that the global commit lock is held.
pub(crate) type CommitGuard<'a> = MutexGuard<'a, ()>;

/// Bytes `offset..offset + bytes.len()` of `obj` as of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenRange {
    pub obj: ObjRef,
    pub offset: usize,
    pub bytes: Box<[u8]>,
}

impl WrittenRange {
    /// Absolute start address in the logical heap.
    #[inline]
    pub fn start(&self) -> usize {
        self.obj.addr() + self.offset
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.bytes.len()
    }
}

/// One published transaction. Immutable once appended.
#[derive(Debug)]
pub struct CommitEntry {
    pub rev: u64,
    pub segment: usize,
    pub writes: Vec<WrittenRange>,
}

impl CommitEntry {
    pub fn written_bytes(&self) -> usize {
        self.writes.iter().map(|w| w.bytes.len()).sum()
    }
}

/// Totally ordered history of commits, readable without the commit lock.
pub(crate) struct CommitLog {
    latest: AtomicU64,
    /// highest retired revision
    retired: AtomicU64,
    /// entries[i].rev == entries[0].rev + i
    entries: RwLock<VecDeque<Arc<CommitEntry>>>,
}

impl CommitLog {
    pub fn new() -> Self {
        Self {
            latest: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    #[inline(always)]
    pub fn latest_rev(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Appends the next revision. Only one publisher at a time, enforced by
    /// the commit lock.
    pub fn publish(
        &self,
        _lock: &CommitGuard<'_>,
        segment: usize,
        writes: Vec<WrittenRange>,
    ) -> Arc<CommitEntry> {
        let rev = self.latest.load(Ordering::Relaxed) + 1;
        let entry = Arc::new(CommitEntry {
            rev,
            segment,
            writes,
        });
        self.entries.write().push_back(entry.clone());
        self.latest.store(rev, Ordering::Release);
        entry
    }

    /// Entries with a revision greater than `rev`, oldest first.
    pub fn entries_after(&self, rev: u64) -> Vec<Arc<CommitEntry>> {
        let entries = self.entries.read();
        let Some(first) = entries.front().map(|e| e.rev) else {
            return Vec::new();
        };
        debug_assert!(
            rev + 1 >= first,
            "revision {rev} already retired (oldest retained {first})"
        );
        let skip = (rev + 1).saturating_sub(first) as usize;
        entries.iter().skip(skip).cloned().collect()
    }

    /// Drops entries up to and including `rev`. Returns how many went.
    pub fn retire_upto(&self, rev: u64) -> usize {
        let mut entries = self.entries.write();
        let mut retired = 0;
        while entries.front().is_some_and(|e| e.rev <= rev) {
            if let Some(entry) = entries.pop_front() {
                self.retired.store(entry.rev, Ordering::Release);
            }
            retired += 1;
        }
        retired
    }

    /// Number of entries still held, without taking the entry lock.
    #[inline]
    pub fn retained(&self) -> u64 {
        self.latest_rev()
            .saturating_sub(self.retired.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}
