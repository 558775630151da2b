use std::sync::atomic::Ordering;

use object::{GcFlags, HEADER_SIZE, Header, ObjRef, WEAKREF_SIZE, WEAKREF_TYPE_ID, align_object_size};

use crate::error::{AbortReason, StmResult};
use crate::gc::minor_collection;
use crate::stm::{SegmentLocal, Stm, StmInner};
use crate::timing::ThreadStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Running,
    Inevitable,
}

/// A thread bound to one segment of an [`Stm`].
///
/// All heap access goes through the barriers of this handle. Raw pointers
/// handed out by the barriers stay valid until the next call that may
/// collect: any barrier slow path, allocation, commit or abort.
#[derive(Debug)]
pub struct StmThread {
    pub(crate) stm: Stm,
    pub(crate) segment: usize,
    pub(crate) state: TxState,
    pub(crate) retry_count: u32,
    pub(crate) running_finalizers: bool,
}

impl StmThread {
    pub(crate) fn new(stm: Stm, segment: usize) -> Self {
        Self {
            stm,
            segment,
            state: TxState::Idle,
            retry_count: 0,
            running_finalizers: false,
        }
    }

    #[inline]
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Segment number, 1-based.
    #[inline]
    pub fn segment(&self) -> usize {
        self.segment
    }

    #[inline]
    pub fn state(&self) -> TxState {
        self.state
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.state != TxState::Idle
    }

    #[inline]
    pub fn is_inevitable(&self) -> bool {
        self.state == TxState::Inevitable
    }

    pub fn stats(&self) -> ThreadStats {
        self.stm.slot(self.segment).local.lock().stats
    }

    #[inline(always)]
    pub(crate) fn assert_in_transaction(&self) {
        assert!(
            self.state != TxState::Idle,
            "heap access outside a transaction on segment {}",
            self.segment
        );
    }

    #[inline(always)]
    pub(crate) fn with_local<R>(&self, f: impl FnOnce(&StmInner, &mut SegmentLocal) -> R) -> R {
        let stm = &*self.stm;
        let mut local = stm.slot(self.segment).local.lock();
        f(stm, &mut local)
    }

    // ── Roots ─────────────────────────────────────────────────────────

    /// Pushes a root the collector keeps alive and updates when it moves.
    pub fn push_root(&mut self, obj: ObjRef) {
        self.with_local(|_, local| local.shadow_stack.push(obj));
    }

    pub fn pop_root(&mut self) -> ObjRef {
        self.with_local(|_, local| {
            local
                .shadow_stack
                .pop()
                .expect("pop_root on an empty shadow stack")
        })
    }

    /// Root `depth` entries below the top, 0 being the top.
    pub fn peek_root(&self, depth: usize) -> ObjRef {
        self.with_local(|_, local| {
            let len = local.shadow_stack.len();
            assert!(depth < len, "peek_root({depth}) on a stack of {len}");
            local.shadow_stack[len - 1 - depth]
        })
    }

    pub fn root_count(&self) -> usize {
        self.with_local(|_, local| local.shadow_stack.len())
    }

    /// One extra root slot per thread, restored on abort.
    pub fn set_thread_local(&mut self, obj: ObjRef) {
        self.with_local(|_, local| local.thread_local_obj = obj);
    }

    pub fn thread_local(&self) -> ObjRef {
        self.with_local(|_, local| local.thread_local_obj)
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a zeroed object of `size` bytes (header included) and
    /// writes its header.
    pub fn allocate(&mut self, type_id: u16, size: usize) -> StmResult<ObjRef> {
        self.allocate_object(type_id, size, GcFlags::empty())
    }

    /// Like [`Self::allocate`]; the model's finalizer runs once the object
    /// becomes unreachable.
    pub fn allocate_with_finalizer(&mut self, type_id: u16, size: usize) -> StmResult<ObjRef> {
        self.allocate_object(type_id, size, GcFlags::FINALIZER)
    }

    /// A weak reference to `target`. The target is nulled once it dies.
    pub fn allocate_weakref(&mut self, target: ObjRef) -> StmResult<ObjRef> {
        // the allocation may move a young target; an abort drops the root
        self.push_root(target);
        let weakref = self.allocate_object(WEAKREF_TYPE_ID, WEAKREF_SIZE, GcFlags::WEAKREF)?;
        let target = self.pop_root();
        let ptr = self.stm.segments.memory(self.segment).translate(weakref);
        // SAFETY: freshly allocated weakref in this segment's view
        unsafe { crate::model::weakref_target(ptr).write(target) };
        Ok(weakref)
    }

    /// Registers the model's light finalizer for `obj`.
    pub fn enable_light_finalizer(&mut self, obj: ObjRef) -> StmResult<()> {
        self.assert_in_transaction();
        self.safepoint()?;
        self.with_local(|stm, local| {
            let ptr = stm.segments.memory(self.segment).translate(obj);
            // SAFETY: obj is a live object visible to this segment
            let header = unsafe { &*ptr.cast::<Header>() };
            if header.has_flag(GcFlags::LIGHT_FINALIZER) {
                return;
            }
            header.add_flag(GcFlags::LIGHT_FINALIZER);
            if local.nursery.contains(obj.addr()) {
                local.young_light_finalizers.push(obj);
            } else if local.new_objects.contains(&obj) {
                local.new_light_finalizers.push(obj);
            } else {
                stm.gc_tables.lock().light_finalizers.push(obj);
            }
        });
        Ok(())
    }

    fn allocate_object(&mut self, type_id: u16, size: usize, flags: GcFlags) -> StmResult<ObjRef> {
        self.assert_in_transaction();
        self.safepoint()?;
        let segment = self.segment;
        let result = self.with_local(|stm, local| allocate_locked(stm, segment, local, type_id, size, flags));
        result.map_err(|reason| self.abort_with(reason))
    }

    // ── Typed access ──────────────────────────────────────────────────

    pub fn read_word(&mut self, obj: ObjRef, offset: usize) -> StmResult<u64> {
        debug_assert!(offset >= HEADER_SIZE && offset.is_multiple_of(8));
        let ptr = self.read_barrier(obj)?;
        // SAFETY: offset is inside the object per the caller's layout
        Ok(unsafe { ptr.add(offset).cast::<u64>().read() })
    }

    pub fn write_word(&mut self, obj: ObjRef, offset: usize, value: u64) -> StmResult<()> {
        debug_assert!(offset >= HEADER_SIZE && offset.is_multiple_of(8));
        let ptr = self.write_barrier(obj)?;
        // SAFETY: offset is inside the object per the caller's layout
        unsafe { ptr.add(offset).cast::<u64>().write(value) };
        Ok(())
    }

    pub fn read_ref(&mut self, obj: ObjRef, offset: usize) -> StmResult<ObjRef> {
        self.read_word(obj, offset).map(ObjRef::from_raw)
    }

    pub fn write_ref(&mut self, obj: ObjRef, offset: usize, value: ObjRef) -> StmResult<()> {
        self.write_word(obj, offset, value.raw())
    }

    pub fn read_bytes(&mut self, obj: ObjRef, offset: usize, len: usize) -> StmResult<Vec<u8>> {
        debug_assert!(offset >= HEADER_SIZE);
        let ptr = self.read_barrier(obj)?;
        // SAFETY: range is inside the object per the caller's layout
        Ok(unsafe { std::slice::from_raw_parts(ptr.add(offset), len) }.to_vec())
    }

    pub fn write_bytes(&mut self, obj: ObjRef, offset: usize, bytes: &[u8]) -> StmResult<()> {
        debug_assert!(offset >= HEADER_SIZE);
        let ptr = self.write_barrier(obj)?;
        // SAFETY: range is inside the object per the caller's layout
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len()) };
        Ok(())
    }

    /// Current target of a weakref, null once the target died.
    pub fn read_weakref(&mut self, weakref: ObjRef) -> StmResult<ObjRef> {
        let ptr = self.read_barrier(weakref)?;
        // SAFETY: ptr is a weakref visible to this segment
        unsafe {
            debug_assert!((*ptr.cast::<Header>()).is_weakref());
            Ok(crate::model::weakref_target(ptr.cast_mut()).read())
        }
    }
}

/// Objects above this size skip the nursery.
#[inline]
fn direct_old_limit(local: &SegmentLocal) -> usize {
    local.nursery.capacity() / 2
}

pub(crate) fn allocate_locked(
    stm: &StmInner,
    segment: usize,
    local: &mut SegmentLocal,
    type_id: u16,
    size: usize,
    mut flags: GcFlags,
) -> Result<ObjRef, AbortReason> {
    let size = align_object_size(size);
    if size >= stm.settings.card_marking_min_size {
        flags |= GcFlags::HAS_CARDS;
    }

    let young = size <= direct_old_limit(local);
    let addr = if young {
        match local.nursery.allocate(size) {
            Some(addr) => addr,
            None => {
                if minor_collection(stm, segment, local).is_err() {
                    stm.request_major();
                    return Err(AbortReason::MemoryPressure);
                }
                local
                    .nursery
                    .allocate(size)
                    .ok_or(AbortReason::MemoryPressure)?
            }
        }
    } else {
        let Some(addr) = stm.allocate_old(size) else {
            log::warn!("segment {segment}: no old space for {size} bytes");
            stm.request_major();
            return Err(AbortReason::MemoryPressure);
        };
        let imported = stm.privatize_range(segment, addr, size, &mut local.private_pages);
        local.stats.pages_imported += imported as u64;
        flags |= GcFlags::WRITE_BARRIER;
        addr
    };

    let obj = ObjRef::from_addr(addr);
    let ptr = stm.segments.memory(segment).translate(obj);
    // SAFETY: fresh allocation of `size` bytes in this segment's view
    unsafe {
        ptr.write_bytes(0, size);
        ptr.cast::<Header>().write(Header::with_flags(type_id, flags));
    }

    if young {
        if flags.contains(GcFlags::FINALIZER) {
            local.young_finalizers.push(obj);
        }
        if flags.contains(GcFlags::WEAKREF) {
            local.young_weakrefs.push(obj);
        }
    } else {
        local.new_objects.insert(obj);
        if flags.contains(GcFlags::FINALIZER) {
            local.new_finalizers.push(obj);
        }
    }
    Ok(obj)
}

impl Drop for StmThread {
    fn drop(&mut self) {
        if self.state != TxState::Idle {
            self.abort_internal(AbortReason::Explicit);
        }
        let stm = &*self.stm;
        let slot = stm.slot(self.segment);
        {
            let mut local = slot.local.lock();
            local.shadow_stack.clear();
            local.thread_local_obj = ObjRef::NULL;
            local.registered = false;
            stm.segments.reset_segment(self.segment);
        }
        slot.in_use.store(false, Ordering::Release);
        log::debug!("thread left segment {}", self.segment);
    }
}
