use std::sync::atomic::Ordering;

use ahash::AHashMap;
use object::ObjRef;
use parking_lot::MutexGuard;

use super::finalizer::order_finalizers;
use super::minor_collection;
use crate::barrier::validate;
use crate::error::{AbortReason, StmResult};
use crate::model::{trace_object, weakref_target};
use crate::safepoint::Election;
use crate::segment::{PageState, SHARING_SEGMENT};
use crate::stm::{SegmentLocal, StmInner};
use crate::thread::{StmThread, TxState};
use crate::timing::TimingEvent;
use crate::transaction::rollback;

// ── Rendezvous ────────────────────────────────────────────────────────

/// Synchronization point of a major collection. Every thread inside a
/// transaction ends up here: first each drains its own nursery, then the
/// coordinator collects while everybody else sleeps.
///
/// Parties leave only after the coordinator ended the generation they
/// joined, so no barrier round of one collection can overlap the next.
pub(crate) fn rendezvous(stm: &StmInner, segment: Option<usize>, election: Option<Election>) {
    let snapshot = stm.sync.state.snapshot();
    if !snapshot.collecting {
        return;
    }
    if let Some(election) = election {
        debug_assert_eq!(election.generation, snapshot.generation);
    }
    let participants = snapshot.in_transaction as usize;

    // Phase 1: empty our nursery so only old objects remain
    if let Some(segment) = segment {
        let slot = stm.slot(segment);
        let mut local = slot.local.lock();
        if local.tx_active && minor_collection(stm, segment, &mut local).is_err() {
            assert!(
                !local.inevitable,
                "out of memory in inevitable transaction on segment {segment}"
            );
            rollback(stm, segment, &mut local);
            local.pending_abort = Some(AbortReason::MemoryPressure);
            slot.flag_abort(AbortReason::MemoryPressure);
        }
    }

    // every nursery is empty
    stm.sync.barrier.wait(participants);

    if election.is_some() {
        major_collect(stm, segment.unwrap_or(SHARING_SEGMENT));
    }

    // collection done, every party has arrived at its last barrier
    stm.sync.barrier.wait(participants);

    match election {
        Some(_) => stm.sync.state.finish(snapshot.generation),
        None => stm.sync.state.wait_for_end(snapshot.generation),
    }
}

/// Runs a collection with the caller counted as a party, coordinating it
/// unless another one is already under way.
fn collect_as_party(stm: &StmInner, segment: usize) {
    let election = stm.sync.state.try_start();
    if let Some(Election {
        generation,
        participants,
    }) = election
    {
        log::debug!("major collection {generation} with {participants} participants");
    }
    rendezvous(stm, Some(segment), election);
}

// ── Marking ───────────────────────────────────────────────────────────

pub(super) struct Marker<'a> {
    stm: &'a StmInner,
    /// uncommitted objects -> the only segment holding their bytes
    owners: AHashMap<ObjRef, usize>,
    work: Vec<(ObjRef, usize)>,
}

impl<'a> Marker<'a> {
    #[inline]
    fn view_of(&self, obj: ObjRef) -> usize {
        self.owners.get(&obj).copied().unwrap_or(SHARING_SEGMENT)
    }

    pub(super) fn is_marked(&self, obj: ObjRef) -> bool {
        self.stm.marks.is_marked(obj.addr())
    }

    pub(super) fn mark(&mut self, obj: ObjRef) {
        if obj.is_null() {
            return;
        }
        debug_assert!(
            self.stm.layout.is_old(obj.addr()),
            "{obj:?} is not in old space during a major collection"
        );
        if self.stm.marks.mark(obj.addr()) {
            let view = self.view_of(obj);
            self.work.push((obj, view));
        }
    }

    /// Traces `obj` as seen by segment `view`, without marking it.
    fn trace_in(&mut self, obj: ObjRef, view: usize) {
        let stm = self.stm;
        let ptr = stm.segments.memory(view).translate(obj);
        // SAFETY: obj is initialised in that view
        unsafe { trace_object(&*stm.model, ptr, &mut |slot| self.mark(*slot)) };
    }

    pub(super) fn children(&self, obj: ObjRef) -> Vec<ObjRef> {
        let stm = self.stm;
        let ptr = stm.segments.memory(self.view_of(obj)).translate(obj);
        let mut out = Vec::new();
        // SAFETY: obj is initialised in that view
        unsafe {
            trace_object(&*stm.model, ptr, &mut |slot| {
                if !slot.is_null() {
                    out.push(*slot)
                }
            })
        };
        out
    }

    pub(super) fn drain(&mut self) {
        while let Some((obj, view)) = self.work.pop() {
            self.trace_in(obj, view);
        }
    }

    fn mark_segment_roots(&mut self, segment: usize, local: &mut SegmentLocal) {
        for i in 0..local.shadow_stack.len() {
            self.mark(local.shadow_stack[i]);
        }
        self.mark(local.thread_local_obj);
        self.mark(local.thread_local_at_start);
        for &obj in &local.new_finalizers {
            self.mark(obj);
        }

        // written objects: the current version lives in the segment view,
        // the pre-transaction version in the backups
        let written: Vec<ObjRef> = local
            .modified
            .keys()
            .chain(local.card_backups.keys())
            .copied()
            .collect();
        for obj in written {
            self.mark(obj);
            self.trace_in(obj, segment);
        }
        let stm = self.stm;
        for backup in local.backups.iter_mut() {
            // SAFETY: backups hold complete objects with aligned references
            unsafe { trace_object(&*stm.model, backup.as_mut_ptr(), &mut |slot| self.mark(*slot)) };
        }
    }
}

// ── Collection ────────────────────────────────────────────────────────

/// The coordinator's part of a major collection. All threads in a
/// transaction are parked in [`rendezvous`] with empty nurseries.
fn major_collect(stm: &StmInner, coordinator: usize) {
    stm.emit(coordinator, TimingEvent::MajorGcStart);

    let mut locals: Vec<(usize, MutexGuard<'_, SegmentLocal>)> = stm
        .slots
        .iter()
        .map(|slot| (slot.id, slot.local.lock()))
        .filter(|(_, local)| local.registered)
        .collect();
    let _commit = stm.commit_lock.lock();

    // ── 1. bring every segment to the latest revision ──
    for (segment, local) in locals.iter_mut() {
        debug_assert!(local.nursery.is_empty());
        if let Err(reason) = validate(stm, *segment, local) {
            if local.tx_active {
                stm.slot(*segment).flag_abort(reason);
            }
        }
    }
    let retired = stm.commit_log.retire_upto(stm.commit_log.latest_rev());

    // ── 2. mark ──
    stm.marks.advance();
    let owners = locals
        .iter()
        .flat_map(|(segment, local)| local.new_objects.iter().map(move |&obj| (obj, *segment)))
        .collect();
    let mut marker = Marker {
        stm,
        owners,
        work: Vec::new(),
    };
    for (segment, local) in locals.iter_mut() {
        marker.mark_segment_roots(*segment, local);
    }

    let mut tables = stm.gc_tables.lock();
    for i in 0..tables.pending_finalizers.len() {
        marker.mark(tables.pending_finalizers[i]);
    }
    marker.drain();

    // ── 3. finalizers ──
    let ready = order_finalizers(&mut marker, &mut tables.finalizers);
    let finalized = ready.len();
    tables.pending_finalizers.extend(ready);

    // ── 4. weakrefs ──
    let null = ObjRef::NULL.raw().to_ne_bytes();
    let mut cleared = 0;
    for &weakref in &tables.weakrefs {
        if !marker.is_marked(weakref) {
            continue;
        }
        // SAFETY: committed weakref in the sharing view
        let target = unsafe { *weakref_target(stm.segments.sharing().translate(weakref)) };
        if target.is_null() || marker.is_marked(target) {
            continue;
        }
        let field = weakref.addr() + object::HEADER_SIZE;
        // SAFETY: field lies inside the sharing mapping
        unsafe { std::ptr::copy_nonoverlapping(null.as_ptr(), stm.segments.sharing().at(field), 8) };
        for (segment, _) in locals.iter() {
            stm.segments.apply_to_view(*segment, field, &null);
        }
        cleared += 1;
    }
    for (segment, local) in locals.iter() {
        let memory = stm.segments.memory(*segment);
        for &weakref in &local.new_weakrefs {
            if !marker.is_marked(weakref) {
                continue;
            }
            // SAFETY: uncommitted weakref in its owner's view
            let target = unsafe { &mut *weakref_target(memory.translate(weakref)) };
            if !target.is_null() && !marker.is_marked(*target) {
                *target = ObjRef::NULL;
                cleared += 1;
            }
        }
    }

    // ── 5. light finalizers ──
    tables.light_finalizers.retain(|&obj| {
        if marker.is_marked(obj) {
            return true;
        }
        // SAFETY: dead object still intact in the sharing view
        unsafe { stm.model.light_finalizer(stm.segments.sharing().translate(obj)) };
        false
    });
    for (segment, local) in locals.iter_mut() {
        let memory = stm.segments.memory(*segment);
        local.new_light_finalizers.retain(|&obj| {
            if marker.is_marked(obj) {
                return true;
            }
            // SAFETY: dead object still intact in its owner's view
            unsafe { stm.model.light_finalizer(memory.translate(obj)) };
            false
        });
    }

    // ── 6. sweep ──
    let marks = &stm.marks;
    let mut freed_objects = 0usize;
    let sweep = {
        let mut old = stm.old_space.lock();
        let sweep = old.sweep(&|addr| marks.is_marked(addr), &mut |_, _| freed_objects += 1);
        stm.old_in_use.store(old.in_use_bytes(), Ordering::Relaxed);
        sweep
    };

    tables.weakrefs.retain(|&o| marks.is_marked(o.addr()));
    debug_assert!(tables.finalizers.iter().all(|&o| marks.is_marked(o.addr())));
    drop(tables);
    for (_, local) in locals.iter_mut() {
        local.new_objects.retain(|&o| marks.is_marked(o.addr()));
        local.new_weakrefs.retain(|&o| marks.is_marked(o.addr()));
    }

    // ── 7. give unmodified pages of idle segments back ──
    let mut reshared = 0;
    for (segment, local) in locals.iter() {
        if local.tx_active {
            continue;
        }
        let memory = stm.segments.memory(*segment);
        for page in stm.layout.old_pages() {
            if memory.page_state(page) == PageState::Shared
                && stm.segments.page_matches_sharing(*segment, page)
            {
                stm.segments.reshare_page(*segment, page);
                reshared += 1;
            }
        }
    }

    stm.major_requested.store(false, Ordering::Release);
    stm.major_collections.fetch_add(1, Ordering::Relaxed);
    log::debug!(
        "major collection: freed {freed_objects} objects, {} bytes, {} pages; {finalized} finalizers, {cleared} weakrefs cleared, {retired} log entries retired, {reshared} pages reshared",
        sweep.freed_bytes,
        sweep.freed_pages,
    );
    stm.emit(
        coordinator,
        TimingEvent::MajorGcDone {
            freed_bytes: sweep.freed_bytes,
        },
    );
}

// ── Thread entry points ───────────────────────────────────────────────

impl StmThread {
    /// Runs a full collection of old space, stopping every thread that is
    /// inside a transaction at its next safepoint.
    ///
    /// Inside a transaction this can flag the transaction for abort, which
    /// is reported here.
    pub fn major_collection(&mut self) -> StmResult<()> {
        if self.state == TxState::Idle {
            self.major_collection_idle();
            Ok(())
        } else {
            collect_as_party(&self.stm, self.segment);
            self.safepoint()
        }
    }

    /// Outside a transaction there is nothing to abort.
    pub(crate) fn major_collection_idle(&mut self) {
        debug_assert_eq!(self.state, TxState::Idle);
        self.stm.sync.state.enter_transaction();
        collect_as_party(&self.stm, self.segment);
        self.leave_collection();
        self.run_pending_finalizers();
    }

    /// Promotes the nursery of the running transaction to old space.
    pub fn minor_collection(&mut self) -> StmResult<()> {
        self.assert_in_transaction();
        self.safepoint()?;
        let segment = self.segment;
        let failed = {
            let stm = &*self.stm;
            let mut local = stm.slot(segment).local.lock();
            minor_collection(stm, segment, &mut local).is_err()
        };
        if failed {
            self.stm.request_major();
            return Err(self.abort_with(AbortReason::MemoryPressure));
        }
        Ok(())
    }
}
