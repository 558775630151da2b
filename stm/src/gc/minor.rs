use std::ops::Range;

use object::{GcFlags, Header, ObjRef};

use super::{forwarded, set_forwarded};
use crate::model::{object_size, trace_object, weakref_target};
use crate::segment::SegmentMemory;
use crate::stm::{SegmentLocal, StmInner};
use crate::timing::TimingEvent;

/// Old space could not take a surviving young object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutOfMemory;

struct Evacuator<'a> {
    stm: &'a StmInner,
    segment: usize,
    memory: &'a SegmentMemory,
    nursery: Range<usize>,
    scan: Vec<ObjRef>,
    promoted: Vec<ObjRef>,
    private_pages: Vec<usize>,
    promoted_bytes: usize,
    imported_pages: usize,
    failed: bool,
}

impl<'a> Evacuator<'a> {
    #[inline(always)]
    fn is_young(&self, obj: ObjRef) -> bool {
        self.nursery.contains(&obj.addr())
    }

    /// Redirects `slot` to the old-space copy of its young target.
    fn visit(&mut self, slot: &mut ObjRef) {
        if slot.is_null() || !self.is_young(*slot) {
            return;
        }
        match self.evacuate(*slot) {
            Some(moved) => *slot = moved,
            None => self.failed = true,
        }
    }

    fn evacuate(&mut self, obj: ObjRef) -> Option<ObjRef> {
        let from = self.memory.translate(obj);
        // SAFETY: young objects of this segment live in its nursery view
        if let Some(moved) = unsafe { forwarded(from) } {
            return Some(moved);
        }
        // SAFETY: from points at a live young object
        let size = unsafe { object_size(&*self.stm.model, from) };
        let addr = self.stm.allocate_old(size)?;
        self.imported_pages +=
            self.stm
                .privatize_range(self.segment, addr, size, &mut self.private_pages);

        let moved = ObjRef::from_addr(addr);
        let to = self.memory.translate(moved);
        // SAFETY: distinct ranges of the same mapping, both `size` bytes
        unsafe {
            std::ptr::copy_nonoverlapping(from, to, size);
            let header = &*to.cast::<Header>();
            header.add_flag(GcFlags::WRITE_BARRIER);
            set_forwarded(from, moved);
        }

        self.scan.push(moved);
        self.promoted.push(moved);
        self.promoted_bytes += size;
        Some(moved)
    }

    fn trace(&mut self, obj: ObjRef) {
        let stm = self.stm;
        let ptr = self.memory.translate(obj);
        // SAFETY: obj is an initialised object in this segment's view
        unsafe { trace_object(&*stm.model, ptr, &mut |slot| self.visit(slot)) };
    }

    /// Traces only the references that fall into `cards`.
    fn trace_cards(&mut self, obj: ObjRef, cards: &crate::cards::CardSet) {
        let stm = self.stm;
        let card_size = stm.settings.card_size;
        let ptr = self.memory.translate(obj);
        let base = ptr as usize;
        // SAFETY: obj is an initialised object in this segment's view
        unsafe {
            trace_object(&*stm.model, ptr, &mut |slot| {
                let offset = slot as *mut ObjRef as usize - base;
                if cards.contains(offset / card_size) {
                    self.visit(slot);
                }
            })
        };
    }

    fn drain(&mut self) {
        while let Some(obj) = self.scan.pop() {
            self.trace(obj);
        }
    }
}

/// Moves every reachable young object of `segment` into old space and
/// fixes up the references to it. Returns the number of promoted bytes.
///
/// On `OutOfMemory` the segment's heap view is left half-updated; the caller
/// has to roll the transaction back.
pub(crate) fn minor_collection(
    stm: &StmInner,
    segment: usize,
    local: &mut SegmentLocal,
) -> Result<usize, OutOfMemory> {
    if local.nursery.is_empty()
        && local.pointing_to_nursery.is_empty()
        && local.cards_since_minor.is_empty()
    {
        return Ok(0);
    }
    stm.emit(segment, TimingEvent::MinorGcStart);

    let memory = stm.segments.memory(segment);
    let mut ev = Evacuator {
        stm,
        segment,
        memory,
        nursery: local.nursery.range(),
        scan: Vec::new(),
        promoted: Vec::new(),
        private_pages: Vec::new(),
        promoted_bytes: 0,
        imported_pages: 0,
        failed: false,
    };

    // ── roots ──
    for slot in local.shadow_stack.iter_mut() {
        ev.visit(slot);
    }
    ev.visit(&mut local.thread_local_obj);
    for &obj in &local.pointing_to_nursery {
        ev.trace(obj);
    }
    for (&obj, cards) in &local.cards_since_minor {
        if !local.pointing_to_nursery.contains(&obj) {
            ev.trace_cards(obj, cards);
        }
    }
    // objects with a finalizer always survive their first collection
    for slot in local.young_finalizers.iter_mut() {
        ev.visit(slot);
    }
    ev.drain();

    // ── weakrefs and light finalizers ──
    for weakref in std::mem::take(&mut local.young_weakrefs) {
        let ptr = memory.translate(weakref);
        // SAFETY: weakref is a young object of this segment
        let Some(moved) = (unsafe { forwarded(ptr) }) else {
            continue;
        };
        // SAFETY: moved is the promoted weakref
        let target = unsafe { &mut *weakref_target(memory.translate(moved)) };
        if !target.is_null() && ev.is_young(*target) {
            // SAFETY: target is a young object of this segment
            *target = unsafe { forwarded(memory.translate(*target)) }.unwrap_or(ObjRef::NULL);
        }
        local.new_weakrefs.push(moved);
    }

    for obj in std::mem::take(&mut local.young_light_finalizers) {
        let ptr = memory.translate(obj);
        // SAFETY: obj is a young object of this segment
        match unsafe { forwarded(ptr) } {
            Some(moved) => local.new_light_finalizers.push(moved),
            // SAFETY: dead object bytes are intact until the nursery resets
            None => unsafe { stm.model.light_finalizer(ptr) },
        }
    }

    local
        .new_finalizers
        .extend(std::mem::take(&mut local.young_finalizers));

    // ── bookkeeping ──
    for &obj in &local.pointing_to_nursery {
        // SAFETY: obj is an old object in this segment's view
        let header = unsafe { &*memory.translate(obj).cast::<Header>() };
        header.add_flag(GcFlags::WRITE_BARRIER);
    }
    local.pointing_to_nursery.clear();
    local.cards_since_minor.clear();
    local.new_objects.extend(ev.promoted.iter().copied());
    local.private_pages.extend(ev.private_pages.iter().copied());
    local.nursery.reset();

    let promoted_bytes = ev.promoted_bytes;
    local.stats.minor_collections += 1;
    local.stats.promoted_bytes += promoted_bytes as u64;
    local.stats.pages_imported += ev.imported_pages as u64;

    if ev.failed {
        log::debug!("minor collection on segment {segment} ran out of old space");
        return Err(OutOfMemory);
    }

    log::trace!(
        "minor collection on segment {segment}: promoted {} objects, {promoted_bytes} bytes",
        ev.promoted.len()
    );
    stm.emit(segment, TimingEvent::MinorGcDone { promoted_bytes });
    Ok(promoted_bytes)
}
