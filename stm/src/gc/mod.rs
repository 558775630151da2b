mod finalizer;
mod major;
mod minor;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};

use object::{GcFlags, HEADER_SIZE, Header, ObjRef};

use crate::segment::MARKER_GRANULE;

pub(crate) use major::rendezvous;
pub(crate) use minor::minor_collection;

/// Epoch-tagged mark bytes, one per object granule. A byte equal to the
/// current epoch means marked; advancing the epoch clears everything.
pub(crate) struct MarkBits {
    marks: Box<[AtomicU8]>,
    epoch: AtomicU8,
}

impl MarkBits {
    pub fn new(heap_size: usize) -> Self {
        let marks = (0..heap_size / MARKER_GRANULE)
            .map(|_| AtomicU8::new(0))
            .collect();
        Self {
            marks,
            epoch: AtomicU8::new(1),
        }
    }

    /// Starts a new marking cycle.
    pub fn advance(&self) {
        let next = self.epoch.load(Ordering::Relaxed).wrapping_add(1);
        if next == 0 {
            for m in self.marks.iter() {
                m.store(0, Ordering::Relaxed);
            }
            self.epoch.store(1, Ordering::Release);
        } else {
            self.epoch.store(next, Ordering::Release);
        }
    }

    #[inline(always)]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.marks[addr / MARKER_GRANULE].load(Ordering::Relaxed)
            == self.epoch.load(Ordering::Relaxed)
    }

    /// Returns true if `addr` was not marked before.
    #[inline(always)]
    pub fn mark(&self, addr: usize) -> bool {
        let epoch = self.epoch.load(Ordering::Relaxed);
        self.marks[addr / MARKER_GRANULE].swap(epoch, Ordering::Relaxed) != epoch
    }
}

/// Committed objects with special treatment during collection.
#[derive(Debug, Default)]
pub(crate) struct GcTables {
    pub weakrefs: Vec<ObjRef>,
    pub light_finalizers: Vec<ObjRef>,
    /// registered, not yet found unreachable
    pub finalizers: Vec<ObjRef>,
    /// unreachable, waiting for their finalizer to run
    pub pending_finalizers: VecDeque<ObjRef>,
}

// ── Forwarding ────────────────────────────────────────────────────────

/// Where a moved young object lives now.
///
/// # Safety
/// `ptr` points at a young object.
#[inline(always)]
pub(crate) unsafe fn forwarded(ptr: *const u8) -> Option<ObjRef> {
    // SAFETY: header is the first field
    let header = unsafe { &*ptr.cast::<Header>() };
    if header.has_flag(GcFlags::FORWARDED) {
        // SAFETY: every object has at least one word after the header
        Some(unsafe { ptr.add(HEADER_SIZE).cast::<ObjRef>().read() })
    } else {
        None
    }
}

/// # Safety
/// `ptr` points at a young object whose content was already copied.
#[inline(always)]
pub(crate) unsafe fn set_forwarded(ptr: *mut u8, to: ObjRef) {
    // SAFETY: header is the first field
    let header = unsafe { &*ptr.cast::<Header>() };
    header.add_flag(GcFlags::FORWARDED);
    // SAFETY: every object has at least one word after the header
    unsafe { ptr.add(HEADER_SIZE).cast::<ObjRef>().write(to) };
}
