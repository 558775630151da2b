use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use object::ObjRef;

use crate::commit_log::CommitGuard;
use crate::error::StmError;
use crate::settings::HeapLayout;
use crate::system::{discard_memory, map_memory, unmap_memory};

/// Identifier of the sharing segment holding the latest committed bytes.
pub const SHARING_SEGMENT: usize = 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Not copied into this segment yet.
    NoAccess = 0,
    /// A copy of the sharing segment, not written by the running transaction.
    Shared = 1,
    /// Written by the running transaction (or nursery).
    Private = 2,
}

impl PageState {
    #[inline(always)]
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PageState::Shared,
            2 => PageState::Private,
            _ => PageState::NoAccess,
        }
    }
}

// ── Segment memory ────────────────────────────────────────────────────

/// One contiguous view of the whole logical heap.
pub(crate) struct SegmentMemory {
    base: NonNull<u8>,
    size: usize,
    pages: Box<[AtomicU8]>,
}

// SAFETY: the mapping is plain memory; concurrent access is coordinated by
// the segment owner, the commit lock and the collection rendezvous
unsafe impl Send for SegmentMemory {}
// SAFETY: see above
unsafe impl Sync for SegmentMemory {}

impl SegmentMemory {
    fn new(layout: &HeapLayout) -> Result<Self, StmError> {
        let base = map_memory(layout.heap_size).ok_or(StmError::MemoryMap {
            bytes: layout.heap_size,
        })?;
        let pages = (0..layout.page_count())
            .map(|_| AtomicU8::new(PageState::NoAccess as u8))
            .collect();
        Ok(Self {
            base,
            size: layout.heap_size,
            pages,
        })
    }

    #[inline(always)]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline(always)]
    pub fn at(&self, addr: usize) -> *mut u8 {
        debug_assert!(addr < self.size, "address {addr:#x} outside heap");
        // SAFETY: addr is inside the mapping
        unsafe { self.base.as_ptr().add(addr) }
    }

    #[inline(always)]
    pub fn translate(&self, obj: ObjRef) -> *mut u8 {
        self.at(obj.addr())
    }

    #[inline(always)]
    pub fn page_state(&self, page: usize) -> PageState {
        PageState::from_u8(self.pages[page].load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_page_state(&self, page: usize, state: PageState) {
        self.pages[page].store(state as u8, Ordering::Release);
    }
}

impl Drop for SegmentMemory {
    fn drop(&mut self) {
        unmap_memory(self.base, self.size);
    }
}

// ── Segment set ───────────────────────────────────────────────────────

/// The sharing segment plus every thread segment, all the same size.
pub(crate) struct Segments {
    layout: HeapLayout,
    memories: Box<[SegmentMemory]>,
}

impl Segments {
    pub fn new(layout: HeapLayout, thread_segments: usize) -> Result<Self, StmError> {
        let memories = (0..=thread_segments)
            .map(|_| SegmentMemory::new(&layout))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();
        // the sharing segment is the source of truth for every page
        let sharing = &memories[SHARING_SEGMENT];
        for page in 0..layout.page_count() {
            sharing.set_page_state(page, PageState::Shared);
        }
        Ok(Self { layout, memories })
    }

    /// Stable base address of segment `id`'s view.
    #[inline]
    pub fn map_segment(&self, id: usize) -> NonNull<u8> {
        self.memories[id].base()
    }

    #[inline(always)]
    pub fn memory(&self, id: usize) -> &SegmentMemory {
        &self.memories[id]
    }

    #[inline(always)]
    pub fn sharing(&self) -> &SegmentMemory {
        &self.memories[SHARING_SEGMENT]
    }

    #[inline]
    pub fn is_accessible(&self, segment: usize, addr: usize, len: usize) -> bool {
        let memory = self.memory(segment);
        self.layout
            .pages_spanned(addr, len)
            .all(|page| memory.page_state(page) != PageState::NoAccess)
    }

    /// Copies the sharing segment's bytes of `page` into `segment`.
    /// Requires the commit lock so no publish races the copy.
    pub fn import_page(&self, _lock: &CommitGuard<'_>, segment: usize, page: usize) {
        debug_assert_ne!(segment, SHARING_SEGMENT);
        let memory = self.memory(segment);
        if memory.page_state(page) != PageState::NoAccess {
            return;
        }
        let addr = page * self.layout.page_size;
        // SAFETY: distinct mappings, page lies inside both
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.sharing().at(addr),
                memory.at(addr),
                self.layout.page_size,
            );
        }
        memory.set_page_state(page, PageState::Shared);
    }

    /// Imports every page touched by `addr..addr + len`. Returns the number
    /// of pages copied.
    pub fn import_range(
        &self,
        lock: &CommitGuard<'_>,
        segment: usize,
        addr: usize,
        len: usize,
    ) -> usize {
        let memory = self.memory(segment);
        let mut imported = 0;
        for page in self.layout.pages_spanned(addr, len) {
            if memory.page_state(page) == PageState::NoAccess {
                self.import_page(lock, segment, page);
                imported += 1;
            }
        }
        imported
    }

    /// Marks an accessible page as written by the running transaction.
    /// Returns true on the Shared to Private transition.
    pub fn privatize_page(&self, segment: usize, page: usize) -> bool {
        let memory = self.memory(segment);
        match memory.page_state(page) {
            PageState::Shared => {
                memory.set_page_state(page, PageState::Private);
                true
            }
            PageState::Private => false,
            PageState::NoAccess => panic!("privatizing page {page} before importing it"),
        }
    }

    /// Drops `segment`'s copy of `page`; the next access re-imports it.
    pub fn reshare_page(&self, segment: usize, page: usize) {
        debug_assert_ne!(segment, SHARING_SEGMENT);
        let memory = self.memory(segment);
        let addr = page * self.layout.page_size;
        // SAFETY: page lies inside the mapping
        let ptr = unsafe { NonNull::new_unchecked(memory.at(addr)) };
        discard_memory(ptr, self.layout.page_size);
        memory.set_page_state(page, PageState::NoAccess);
    }

    pub fn page_matches_sharing(&self, segment: usize, page: usize) -> bool {
        let addr = page * self.layout.page_size;
        let len = self.layout.page_size;
        // SAFETY: both ranges are inside live mappings
        unsafe {
            let mine = std::slice::from_raw_parts(self.memory(segment).at(addr), len);
            let shared = std::slice::from_raw_parts(self.sharing().at(addr), len);
            mine == shared
        }
    }

    /// Publishes committed bytes into the sharing segment.
    pub fn write_shared(&self, _lock: &CommitGuard<'_>, addr: usize, bytes: &[u8]) {
        // SAFETY: range lies inside the sharing mapping
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.sharing().at(addr), bytes.len());
        }
    }

    /// Applies committed bytes to the pages of `segment` that hold a copy.
    pub fn apply_to_view(&self, segment: usize, addr: usize, bytes: &[u8]) {
        let memory = self.memory(segment);
        let page_size = self.layout.page_size;
        let end = addr + bytes.len();
        let mut cursor = addr;
        while cursor < end {
            let page = cursor / page_size;
            let chunk_end = end.min((page + 1) * page_size);
            if memory.page_state(page) != PageState::NoAccess {
                let src = &bytes[cursor - addr..chunk_end - addr];
                // SAFETY: range lies inside the mapping
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr(), memory.at(cursor), src.len());
                }
            }
            cursor = chunk_end;
        }
    }

    /// Every page of `segment` back to NoAccess, used when a thread leaves.
    pub fn reset_segment(&self, segment: usize) {
        let memory = self.memory(segment);
        for page in 0..self.layout.page_count() {
            if memory.page_state(page) != PageState::NoAccess {
                self.reshare_page(segment, page);
            }
        }
    }
}

// ── Read markers ──────────────────────────────────────────────────────

/// Objects are at least 16 bytes, so no two objects share a granule.
pub(crate) const MARKER_GRANULE: usize = 16;

/// Per-segment record of objects read by the running transaction. A marker
/// counts as set when it equals the segment's current read version.
pub(crate) struct ReadMarkers {
    marks: Box<[AtomicU8]>,
    version: AtomicU8,
}

impl std::fmt::Debug for ReadMarkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadMarkers")
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ReadMarkers {
    pub fn new(heap_size: usize) -> Self {
        let marks = (0..heap_size / MARKER_GRANULE)
            .map(|_| AtomicU8::new(0))
            .collect();
        Self {
            marks,
            version: AtomicU8::new(1),
        }
    }

    #[inline(always)]
    pub fn is_read(&self, obj: ObjRef) -> bool {
        let version = self.version.load(Ordering::Acquire);
        self.marks[obj.addr() / MARKER_GRANULE].load(Ordering::Acquire) == version
    }

    #[inline(always)]
    pub fn mark(&self, obj: ObjRef) {
        let version = self.version.load(Ordering::Relaxed);
        self.marks[obj.addr() / MARKER_GRANULE].store(version, Ordering::Release);
    }

    /// Starts a new marker epoch, clearing every marker on wraparound.
    pub fn advance(&self) {
        let next = self.version.load(Ordering::Relaxed).wrapping_add(1);
        if next == 0 {
            for m in self.marks.iter() {
                m.store(0, Ordering::Relaxed);
            }
            self.version.store(1, Ordering::Release);
        } else {
            self.version.store(next, Ordering::Release);
        }
    }
}
