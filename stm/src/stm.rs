use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use ahash::{AHashMap, AHashSet};
use object::ObjRef;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::alloc::{Nursery, OldSpace};
use crate::cards::{CardBackup, CardSet};
use crate::commit_log::{CommitEntry, CommitLog};
use crate::error::{AbortReason, StmError};
use crate::gc::{GcTables, MarkBits};
use crate::model::ObjectModel;
use crate::safepoint::SyncState;
use crate::segment::{PageState, ReadMarkers, Segments};
use crate::settings::{HeapLayout, StmSettings};
use crate::thread::StmThread;
use crate::timing::{StmStats, ThreadStats, TimingCallback, TimingEvent};

// ── Backups ───────────────────────────────────────────────────────────

/// Pre-transaction copy of a whole object. Word storage keeps reference
/// fields aligned so the copy can be traced.
#[derive(Debug)]
pub(crate) struct Backup {
    words: Box<[u64]>,
}

impl Backup {
    /// # Safety
    /// `obj` points at `size` readable bytes, `size` is a multiple of 8.
    pub unsafe fn capture(obj: *const u8, size: usize) -> Self {
        debug_assert!(size.is_multiple_of(8));
        let mut words = vec![0u64; size / 8].into_boxed_slice();
        // SAFETY: both regions are `size` bytes
        unsafe { std::ptr::copy_nonoverlapping(obj, words.as_mut_ptr().cast(), size) };
        Self { words }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: u64 storage reinterpreted as bytes
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast(), self.words.len() * 8) }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: u64 storage reinterpreted as bytes
        unsafe {
            std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.words.len() * 8)
        }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }
}

// ── Segment-local state ───────────────────────────────────────────────

/// State of one thread segment. Locked by its owner for every operation and
/// by the major collection coordinator while everybody else is parked.
#[derive(Debug)]
pub(crate) struct SegmentLocal {
    /// a thread is bound to this segment
    pub registered: bool,
    /// a transaction is running and has not been rolled back yet
    pub tx_active: bool,
    pub inevitable: bool,
    pub last_validated: u64,
    pub start_rev: u64,
    pub nursery: Nursery,

    pub shadow_stack: Vec<ObjRef>,
    pub stack_depth_at_start: usize,
    pub thread_local_obj: ObjRef,
    pub thread_local_at_start: ObjRef,

    /// old objects written this transaction -> index into `backups`
    pub modified: AHashMap<ObjRef, usize>,
    pub backups: Vec<Backup>,
    /// card-marked objects written through the card barrier only
    pub card_backups: AHashMap<ObjRef, CardBackup>,
    /// card-marked objects written since the last minor collection
    pub cards_since_minor: AHashMap<ObjRef, CardSet>,
    /// old objects with WRITE_BARRIER cleared since the last minor collection
    pub pointing_to_nursery: Vec<ObjRef>,
    /// promoted or directly old-allocated this transaction, not yet committed
    pub new_objects: AHashSet<ObjRef>,
    pub private_pages: Vec<usize>,

    pub young_weakrefs: Vec<ObjRef>,
    pub young_light_finalizers: Vec<ObjRef>,
    pub young_finalizers: Vec<ObjRef>,
    pub new_weakrefs: Vec<ObjRef>,
    pub new_light_finalizers: Vec<ObjRef>,
    pub new_finalizers: Vec<ObjRef>,

    /// set when a collection already rolled the transaction back
    pub pending_abort: Option<AbortReason>,
    pub stats: ThreadStats,
}

impl SegmentLocal {
    fn new(nursery: Nursery) -> Self {
        Self {
            registered: false,
            tx_active: false,
            inevitable: false,
            last_validated: 0,
            start_rev: 0,
            nursery,
            shadow_stack: Vec::with_capacity(64),
            stack_depth_at_start: 0,
            thread_local_obj: ObjRef::NULL,
            thread_local_at_start: ObjRef::NULL,
            modified: AHashMap::new(),
            backups: Vec::new(),
            card_backups: AHashMap::new(),
            cards_since_minor: AHashMap::new(),
            pointing_to_nursery: Vec::new(),
            new_objects: AHashSet::new(),
            private_pages: Vec::new(),
            young_weakrefs: Vec::new(),
            young_light_finalizers: Vec::new(),
            young_finalizers: Vec::new(),
            new_weakrefs: Vec::new(),
            new_light_finalizers: Vec::new(),
            new_finalizers: Vec::new(),
            pending_abort: None,
            stats: ThreadStats::default(),
        }
    }

    /// Clean slate for a newly registered thread.
    fn reset(&mut self, latest_rev: u64) {
        debug_assert!(!self.tx_active);
        self.registered = true;
        self.last_validated = latest_rev;
        self.nursery.reset();
        self.shadow_stack.clear();
        self.stack_depth_at_start = 0;
        self.thread_local_obj = ObjRef::NULL;
        self.thread_local_at_start = ObjRef::NULL;
        self.pending_abort = None;
        self.stats = ThreadStats::default();
    }

    /// Drops all per-transaction bookkeeping.
    pub fn clear_transaction(&mut self) {
        self.modified.clear();
        self.backups.clear();
        self.card_backups.clear();
        self.cards_since_minor.clear();
        self.pointing_to_nursery.clear();
        self.new_objects.clear();
        self.private_pages.clear();
        self.young_weakrefs.clear();
        self.young_light_finalizers.clear();
        self.young_finalizers.clear();
        self.new_weakrefs.clear();
        self.new_light_finalizers.clear();
        self.new_finalizers.clear();
        self.nursery.reset();
        self.inevitable = false;
        self.tx_active = false;
    }
}

/// Cross-thread visible state of a thread segment.
#[derive(Debug)]
pub(crate) struct SegmentSlot {
    pub id: usize,
    pub in_use: AtomicBool,
    pub running: AtomicBool,
    pub inevitable: AtomicBool,
    pub start_rev: AtomicU64,
    /// nonzero: abort reason code set by another thread
    pub must_abort: AtomicU8,
    pub markers: ReadMarkers,
    pub local: Mutex<SegmentLocal>,
}

impl SegmentSlot {
    #[inline(always)]
    pub fn flag_abort(&self, reason: AbortReason) {
        let _ = self.must_abort.compare_exchange(
            0,
            reason.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    #[inline(always)]
    pub fn take_abort(&self) -> Option<AbortReason> {
        if self.must_abort.load(Ordering::Acquire) == 0 {
            return None;
        }
        AbortReason::from_u8(self.must_abort.swap(0, Ordering::AcqRel))
    }
}

// ── StmInner ──────────────────────────────────────────────────────────

/// Core shared engine state.
///
/// Lock order: segment locals (ascending) -> commit lock -> inevitable slot
/// -> gc tables -> old space. The commit log lock is innermost.
pub struct StmInner {
    pub(crate) settings: StmSettings,
    pub(crate) layout: HeapLayout,
    pub(crate) model: Box<dyn ObjectModel>,
    pub(crate) segments: Segments,
    /// slots[i] is thread segment i + 1
    pub(crate) slots: Box<[SegmentSlot]>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) commit_log: CommitLog,
    pub(crate) inevitable: Mutex<Option<usize>>,
    pub(crate) inevitable_released: Condvar,
    pub(crate) old_space: Mutex<OldSpace>,
    /// `OldSpace::in_use_bytes` as of the last allocation or sweep
    pub(crate) old_in_use: AtomicUsize,
    pub(crate) sync: SyncState,
    pub(crate) marks: MarkBits,
    pub(crate) gc_tables: Mutex<GcTables>,
    pub(crate) major_requested: AtomicBool,
    pub(crate) major_collections: AtomicU64,
    pub(crate) timing: RwLock<Option<Box<TimingCallback>>>,
}

impl StmInner {
    pub fn new(settings: StmSettings, model: Box<dyn ObjectModel>) -> Result<Self, StmError> {
        settings.validate()?;
        let layout = settings.layout();
        let segments = Segments::new(layout, settings.segments)?;

        let slots = (1..=settings.segments)
            .map(|id| SegmentSlot {
                id,
                in_use: AtomicBool::new(false),
                running: AtomicBool::new(false),
                inevitable: AtomicBool::new(false),
                start_rev: AtomicU64::new(0),
                must_abort: AtomicU8::new(0),
                markers: ReadMarkers::new(layout.heap_size),
                local: Mutex::new(SegmentLocal::new(Nursery::new(layout.nursery(id)))),
            })
            .collect();

        log::debug!(
            "stm: {} segments, {} byte heap, old space {:#x}..{:#x}",
            settings.segments,
            layout.heap_size,
            layout.old_start,
            layout.old_end
        );

        Ok(Self {
            old_space: Mutex::new(OldSpace::new(&layout, settings.small_object_max)),
            old_in_use: AtomicUsize::new(0),
            marks: MarkBits::new(layout.heap_size),
            settings,
            layout,
            model,
            segments,
            slots,
            commit_lock: Mutex::new(()),
            commit_log: CommitLog::new(),
            inevitable: Mutex::new(None),
            inevitable_released: Condvar::new(),
            sync: SyncState::default(),
            gc_tables: Mutex::new(GcTables::default()),
            major_requested: AtomicBool::new(false),
            major_collections: AtomicU64::new(0),
            timing: RwLock::new(None),
        })
    }

    #[inline(always)]
    pub(crate) fn slot(&self, segment: usize) -> &SegmentSlot {
        &self.slots[segment - 1]
    }

    #[inline]
    pub(crate) fn emit(&self, segment: usize, event: TimingEvent) {
        if let Some(callback) = self.timing.read().as_ref() {
            callback(segment, event);
        }
    }

    /// Makes `addr..addr + len` accessible and Private in `segment`. Newly
    /// privatized pages are appended to `private_pages`. Returns the number
    /// of pages imported from the sharing segment.
    pub(crate) fn privatize_range(
        &self,
        segment: usize,
        addr: usize,
        len: usize,
        private_pages: &mut Vec<usize>,
    ) -> usize {
        let mut imported = 0;
        if !self.segments.is_accessible(segment, addr, len) {
            let lock = self.commit_lock.lock();
            imported = self.segments.import_range(&lock, segment, addr, len);
        }
        for page in self.layout.pages_spanned(addr, len) {
            if self.segments.privatize_page(segment, page) {
                private_pages.push(page);
            }
        }
        imported
    }

    pub(crate) fn request_major(&self) {
        self.major_requested.store(true, Ordering::Release);
    }

    pub(crate) fn allocate_old(&self, size: usize) -> Option<usize> {
        let mut old = self.old_space.lock();
        let addr = old.allocate(size);
        self.old_in_use.store(old.in_use_bytes(), Ordering::Relaxed);
        addr
    }

    /// An explicit request is pending, old space crossed its threshold or
    /// the commit log holds too many entries.
    pub(crate) fn wants_major(&self) -> bool {
        let old_usage = self.old_in_use.load(Ordering::Relaxed) as f64
            / (self.layout.old_end - self.layout.old_start) as f64;
        self.major_requested.load(Ordering::Acquire)
            || old_usage > self.settings.major_gc_threshold
            || self.commit_log.retained() >= self.settings.commit_log_limit as u64
    }
}

// SAFETY: raw segment memory is only touched under the locking protocol above
unsafe impl Send for StmInner {}
// SAFETY: see above
unsafe impl Sync for StmInner {}

// ── Stm (Arc wrapper) ─────────────────────────────────────────────────

/// Handle to a transactional heap. Cheap to clone and share across threads.
#[derive(Clone)]
pub struct Stm(Arc<StmInner>);

impl Stm {
    pub fn new(settings: StmSettings, model: impl ObjectModel) -> Result<Self, StmError> {
        let inner = StmInner::new(settings, Box::new(model))?;
        Ok(Self(Arc::new(inner)))
    }

    /// Binds the calling thread to a free segment.
    pub fn register_thread(&self) -> Result<StmThread, StmError> {
        let slot = self
            .slots
            .iter()
            .find(|slot| {
                slot.in_use
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or(StmError::NoFreeSegment {
                segments: self.settings.segments,
            })?;

        {
            let mut local = slot.local.lock();
            local.reset(self.commit_log.latest_rev());
            let nursery = local.nursery.range();
            let memory = self.segments.memory(slot.id);
            for page in self.layout.pages_spanned(nursery.start, nursery.len()) {
                memory.set_page_state(page, PageState::Private);
            }
        }
        slot.must_abort.store(0, Ordering::Release);
        slot.markers.advance();

        log::debug!("thread registered on segment {}", slot.id);
        Ok(StmThread::new(self.clone(), slot.id))
    }

    /// Base address of `segment`'s view; 0 is the sharing segment.
    pub fn map_segment(&self, segment: usize) -> NonNull<u8> {
        self.segments.map_segment(segment)
    }

    pub fn settings(&self) -> &StmSettings {
        &self.settings
    }

    pub fn set_timing_callback(&self, callback: Option<Box<TimingCallback>>) {
        *self.timing.write() = callback;
    }

    /// Retained commit entries newer than `from_rev`.
    pub fn commit_log_snapshot(&self, from_rev: u64) -> Vec<Arc<CommitEntry>> {
        self.commit_log.entries_after(from_rev)
    }

    pub fn stats(&self) -> StmStats {
        let (allocated, usage) = {
            let old = self.old_space.lock();
            (old.allocated_bytes(), old.usage())
        };
        StmStats {
            latest_rev: self.commit_log.latest_rev(),
            commit_log_len: self.commit_log.len(),
            old_allocated_bytes: allocated,
            old_usage: usage,
            major_collections: self.major_collections.load(Ordering::Relaxed),
            registered_threads: self
                .slots
                .iter()
                .filter(|s| s.in_use.load(Ordering::Acquire))
                .count(),
        }
    }
}

impl Deref for Stm {
    type Target = StmInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("segments", &self.settings.segments)
            .field("latest_rev", &self.commit_log.latest_rev())
            .finish_non_exhaustive()
    }
}
