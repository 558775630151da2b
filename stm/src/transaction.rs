use std::ops::Range;
use std::sync::atomic::Ordering;
use std::time::Duration;

use object::{GcFlags, Header};

use crate::barrier::validate;
use crate::cards::card_range;
use crate::commit_log::WrittenRange;
use crate::contention::{Contender, Loser, resolve};
use crate::error::{Abort, AbortReason, StmResult};
use crate::gc::{self, minor_collection};
use crate::model::object_size;
use crate::segment::PageState;
use crate::stm::{SegmentLocal, StmInner};
use crate::thread::{StmThread, TxState};
use crate::timing::TimingEvent;

const INEVITABLE_POLL: Duration = Duration::from_millis(1);

/// Word-granular ranges where `new` differs from `old`, adjacent words merged.
pub(crate) fn diff_ranges(old: &[u8], new: &[u8]) -> Vec<Range<usize>> {
    debug_assert_eq!(old.len(), new.len());
    let mut ranges: Vec<Range<usize>> = Vec::new();
    for (i, (a, b)) in old.chunks(8).zip(new.chunks(8)).enumerate() {
        if a == b {
            continue;
        }
        let start = i * 8;
        let end = start + a.len();
        match ranges.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => ranges.push(start..end),
        }
    }
    ranges
}

/// Everything the transaction changed, as absolute bytes. Restores the
/// WRITE_BARRIER flag on modified objects first so the flag never shows up
/// as a difference.
fn collect_writes(stm: &StmInner, segment: usize, local: &SegmentLocal) -> Vec<WrittenRange> {
    let memory = stm.segments.memory(segment);
    let mut writes = Vec::new();

    for (&obj, &idx) in &local.modified {
        let ptr = memory.translate(obj);
        // SAFETY: modified objects are present in this view
        let current = unsafe {
            (*ptr.cast::<Header>()).add_flag(GcFlags::WRITE_BARRIER);
            let size = object_size(&*stm.model, ptr);
            std::slice::from_raw_parts(ptr.cast_const(), size)
        };
        for range in diff_ranges(local.backups[idx].bytes(), current) {
            writes.push(WrittenRange {
                obj,
                offset: range.start,
                bytes: current[range].into(),
            });
        }
    }

    let card_size = stm.settings.card_size;
    for (&obj, backup) in &local.card_backups {
        let ptr = memory.translate(obj);
        // SAFETY: card-written objects are present in this view
        let size = unsafe { object_size(&*stm.model, ptr) };
        for &card in backup.cards.keys() {
            let range = card_range(card, card_size, size);
            // SAFETY: range is inside the object
            let bytes = unsafe { std::slice::from_raw_parts(ptr.add(range.start), range.len()) };
            writes.push(WrittenRange {
                obj,
                offset: range.start,
                bytes: bytes.into(),
            });
        }
    }

    for &obj in &local.new_objects {
        let ptr = memory.translate(obj);
        // SAFETY: new objects live in this view
        let bytes = unsafe {
            (*ptr.cast::<Header>()).add_flag(GcFlags::WRITE_BARRIER);
            let size = object_size(&*stm.model, ptr);
            std::slice::from_raw_parts(ptr.cast_const(), size)
        };
        writes.push(WrittenRange {
            obj,
            offset: 0,
            bytes: bytes.into(),
        });
    }
    writes
}

/// Undoes the running transaction in the segment's view. Does nothing if the
/// transaction was already rolled back.
pub(crate) fn rollback(stm: &StmInner, segment: usize, local: &mut SegmentLocal) {
    if !local.tx_active {
        return;
    }
    let memory = stm.segments.memory(segment);

    for (&obj, &idx) in &local.modified {
        let bytes = local.backups[idx].bytes();
        // SAFETY: backup was taken from this object in this view
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), memory.translate(obj), bytes.len()) };
    }
    for (&obj, backup) in &local.card_backups {
        // SAFETY: as above
        unsafe { backup.restore(memory.translate(obj), stm.settings.card_size) };
    }

    // objects allocated by the transaction die with it
    for &obj in local
        .young_light_finalizers
        .iter()
        .chain(local.new_light_finalizers.iter())
    {
        // SAFETY: bytes are intact until the nursery resets
        unsafe { stm.model.light_finalizer(memory.translate(obj)) };
    }

    local.shadow_stack.truncate(local.stack_depth_at_start);
    local.thread_local_obj = local.thread_local_at_start;
    for &page in &local.private_pages {
        if memory.page_state(page) == PageState::Private {
            memory.set_page_state(page, PageState::Shared);
        }
    }
    local.stats.aborts += 1;
    local.clear_transaction();
}

/// Hands committed side tables over to the collector and resets the
/// transaction state after a successful commit.
fn finish_commit(stm: &StmInner, segment: usize, local: &mut SegmentLocal) {
    let memory = stm.segments.memory(segment);
    for &page in &local.private_pages {
        if memory.page_state(page) == PageState::Private {
            memory.set_page_state(page, PageState::Shared);
        }
    }
    {
        let mut tables = stm.gc_tables.lock();
        tables.weakrefs.append(&mut local.new_weakrefs);
        tables.light_finalizers.append(&mut local.new_light_finalizers);
        tables.finalizers.append(&mut local.new_finalizers);
    }
    if local.inevitable {
        local.stats.inevitable_transactions += 1;
    }
    local.stats.commits += 1;
    local.clear_transaction();
}

impl StmThread {
    /// Begins a transaction. Returns how many times the previous attempt
    /// aborted in a row.
    pub fn start_transaction(&mut self) -> u32 {
        assert_eq!(self.state, TxState::Idle, "nested transaction");
        if !self.running_finalizers && self.stm.wants_major() {
            self.major_collection_idle();
        }

        let stm = &*self.stm;
        stm.sync.state.enter_transaction();
        let slot = stm.slot(self.segment);
        let start_rev = stm.commit_log.latest_rev();
        {
            let mut local = slot.local.lock();
            debug_assert!(local.nursery.is_empty());
            local.tx_active = true;
            local.inevitable = false;
            local.pending_abort = None;
            local.start_rev = start_rev;
            local.stack_depth_at_start = local.shadow_stack.len();
            local.thread_local_at_start = local.thread_local_obj;
        }
        slot.must_abort.store(0, Ordering::Release);
        slot.start_rev.store(start_rev, Ordering::Release);
        slot.running.store(true, Ordering::Release);
        self.state = TxState::Running;

        stm.emit(self.segment, TimingEvent::TransactionStart);
        log::trace!("segment {}: start at rev {start_rev}", self.segment);
        self.retry_count
    }

    /// Joins a pending collection and learns about remote aborts.
    pub(crate) fn safepoint(&mut self) -> StmResult<()> {
        if self.stm.sync.state.collecting() {
            gc::rendezvous(&self.stm, Some(self.segment), None);
        }
        if self.in_transaction() {
            if let Some(reason) = self.stm.slot(self.segment).take_abort() {
                return Err(self.abort_with(reason));
            }
        }
        Ok(())
    }

    /// Publishes the transaction. On failure the transaction is already
    /// rolled back.
    pub fn commit_transaction(&mut self) -> StmResult<()> {
        self.assert_in_transaction();
        let segment = self.segment;
        let stm = self.stm.clone();
        let slot = stm.slot(segment);

        let rev = loop {
            self.safepoint()?;
            if self.state != TxState::Inevitable {
                self.wait_for_inevitable()?;
            }

            let mut local = slot.local.lock();
            if minor_collection(&stm, segment, &mut local).is_err() {
                drop(local);
                stm.request_major();
                return Err(self.abort_with(AbortReason::MemoryPressure));
            }

            let lock = stm.commit_lock.lock();
            if self.state != TxState::Inevitable && stm.inevitable.lock().is_some() {
                // somebody became inevitable since we waited
                continue;
            }
            if let Some(reason) = slot.take_abort() {
                drop(lock);
                drop(local);
                return Err(self.abort_with(reason));
            }
            if let Err(reason) = validate(&stm, segment, &mut local) {
                drop(lock);
                drop(local);
                return Err(self.abort_with(reason));
            }

            let writes = collect_writes(&stm, segment, &local);
            let rev = if writes.is_empty() {
                None
            } else {
                let me = Contender {
                    segment,
                    start_rev: local.start_rev,
                    inevitable: local.inevitable,
                };
                let mut victims = Vec::new();
                for other in stm.slots.iter() {
                    if other.id == segment || !other.running.load(Ordering::Acquire) {
                        continue;
                    }
                    if !writes.iter().any(|w| other.markers.is_read(w.obj)) {
                        continue;
                    }
                    let them = Contender {
                        segment: other.id,
                        start_rev: other.start_rev.load(Ordering::Acquire),
                        inevitable: other.inevitable.load(Ordering::Acquire),
                    };
                    match resolve(me, them) {
                        Loser::Other => victims.push(other),
                        Loser::Committer => {
                            drop(lock);
                            drop(local);
                            return Err(self.abort_with(AbortReason::LostContention));
                        }
                    }
                }
                for victim in victims {
                    log::trace!("segment {segment} aborts segment {}", victim.id);
                    victim.flag_abort(AbortReason::RemoteAbort);
                }

                for write in &writes {
                    stm.segments.write_shared(&lock, write.start(), &write.bytes);
                }
                let entry = stm.commit_log.publish(&lock, segment, writes);
                local.last_validated = entry.rev;
                Some(entry.rev)
            };
            drop(lock);

            finish_commit(&stm, segment, &mut local);
            break rev;
        };

        self.end_transaction();
        self.retry_count = 0;
        if let Some(rev) = rev {
            stm.emit(segment, TimingEvent::Commit { rev });
            log::trace!("segment {segment}: committed rev {rev}");
        } else {
            stm.emit(segment, TimingEvent::Commit { rev: stm.commit_log.latest_rev() });
        }
        self.run_pending_finalizers();
        Ok(())
    }

    /// Rolls the running transaction back on request.
    ///
    /// # Panics
    /// If the transaction is inevitable.
    pub fn abort_transaction(&mut self) -> Abort {
        self.assert_in_transaction();
        self.abort_with(AbortReason::Explicit)
    }

    pub(crate) fn abort_with(&mut self, reason: AbortReason) -> Abort {
        if self.state == TxState::Inevitable {
            log::error!("segment {}: inevitable transaction hit {reason}", self.segment);
            panic!("inevitable transaction cannot abort ({reason})");
        }
        self.abort_internal(reason)
    }

    pub(crate) fn abort_internal(&mut self, reason: AbortReason) -> Abort {
        let segment = self.segment;
        let reason = {
            let stm = &*self.stm;
            let mut local = stm.slot(segment).local.lock();
            let reason = local.pending_abort.take().unwrap_or(reason);
            rollback(stm, segment, &mut local);
            reason
        };
        self.end_transaction();
        self.retry_count += 1;

        log::debug!("segment {segment}: abort ({reason}), retry {}", self.retry_count);
        self.stm.emit(segment, TimingEvent::Abort { reason });
        Abort { reason }
    }

    /// Common tail of commit and abort.
    fn end_transaction(&mut self) {
        let stm = &*self.stm;
        let slot = stm.slot(self.segment);
        if self.state == TxState::Inevitable {
            slot.inevitable.store(false, Ordering::Release);
            *stm.inevitable.lock() = None;
            stm.inevitable_released.notify_all();
        }
        slot.running.store(false, Ordering::Release);
        slot.markers.advance();
        self.state = TxState::Idle;
        self.leave_collection();
    }

    /// Stops counting as a collection participant, joining a running
    /// collection first if there is one.
    pub(crate) fn leave_collection(&mut self) {
        let stm = &*self.stm;
        while !stm.sync.state.try_leave_transaction() {
            gc::rendezvous(stm, Some(self.segment), None);
        }
    }

    fn wait_for_inevitable(&mut self) -> StmResult<()> {
        let mut waited = false;
        loop {
            {
                let stm = &*self.stm;
                let mut holder = stm.inevitable.lock();
                match *holder {
                    None => break,
                    Some(s) if s == self.segment => break,
                    Some(_) => {
                        if !waited {
                            stm.emit(self.segment, TimingEvent::WaitInevitableStart);
                            waited = true;
                        }
                        stm.inevitable_released.wait_for(&mut holder, INEVITABLE_POLL);
                    }
                }
            }
            self.safepoint()?;
        }
        if waited {
            self.stm.emit(self.segment, TimingEvent::WaitInevitableDone);
        }
        Ok(())
    }

    /// Turns the running transaction into the single one that cannot abort.
    pub fn become_inevitable(&mut self) -> StmResult<()> {
        self.assert_in_transaction();
        if self.state == TxState::Inevitable {
            return Ok(());
        }
        self.safepoint()?;

        let mut waited = false;
        loop {
            {
                let stm = &*self.stm;
                let mut holder = stm.inevitable.lock();
                if holder.is_none() {
                    *holder = Some(self.segment);
                    break;
                }
                if !waited {
                    stm.emit(self.segment, TimingEvent::WaitInevitableStart);
                    waited = true;
                }
                stm.inevitable_released.wait_for(&mut holder, INEVITABLE_POLL);
            }
            self.safepoint()?;
        }
        if waited {
            self.stm.emit(self.segment, TimingEvent::WaitInevitableDone);
        }

        let segment = self.segment;
        let result = {
            let stm = &*self.stm;
            let slot = stm.slot(segment);
            let mut local = slot.local.lock();
            let _lock = stm.commit_lock.lock();
            let result = match slot.take_abort() {
                Some(reason) => Err(reason),
                None => validate(stm, segment, &mut local),
            };
            if result.is_ok() {
                local.inevitable = true;
                slot.inevitable.store(true, Ordering::Release);
            }
            result
        };

        if let Err(reason) = result {
            let stm = &*self.stm;
            *stm.inevitable.lock() = None;
            stm.inevitable_released.notify_all();
            return Err(self.abort_with(reason));
        }

        self.state = TxState::Inevitable;
        self.stm.emit(segment, TimingEvent::BecomeInevitable);
        log::debug!("segment {segment}: inevitable");
        Ok(())
    }

    /// Runs `body` in a transaction until it commits. `body` gets the number
    /// of aborts so far; after `max_retries_before_inevitable` of them the
    /// transaction turns inevitable before running `body`.
    ///
    /// `body` signals an abort by returning `Err`, typically from a barrier.
    pub fn atomically<T>(&mut self, mut body: impl FnMut(&mut StmThread, u32) -> StmResult<T>) -> T {
        let max_retries = self.stm.settings.max_retries_before_inevitable;
        loop {
            let retry = self.start_transaction();
            if retry >= max_retries {
                if retry == max_retries {
                    log::warn!("segment {}: {retry} aborts in a row, going inevitable", self.segment);
                }
                if self.become_inevitable().is_err() {
                    continue;
                }
            }
            match body(self, retry) {
                Ok(value) => {
                    if self.commit_transaction().is_ok() {
                        return value;
                    }
                }
                Err(_) => {
                    if self.in_transaction() {
                        self.abort_with(AbortReason::Explicit);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::*;
    use object::ObjRef;

    #[test]
    fn diff_merges_adjacent_words() {
        let old = [0u8; 48];
        let mut new = old;
        new[8] = 1;
        new[17] = 2;
        new[40] = 3;
        assert_eq!(diff_ranges(&old, &new), vec![8..24, 40..48]);
        assert!(diff_ranges(&old, &old).is_empty());
    }

    #[test]
    fn commit_is_visible_to_other_segments() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 5);

        a.atomically(|t, _| t.write_word(obj, VALUE, 6));
        let seen = b.atomically(|t, _| t.read_word(obj, VALUE));
        assert_eq!(seen, 6);
        assert_eq!(a.stats().commits, 2);
    }

    #[test]
    fn reads_see_own_writes_and_abort_restores() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 5);

        a.start_transaction();
        a.write_word(obj, VALUE, 9).unwrap();
        assert_eq!(a.read_word(obj, VALUE).unwrap(), 9);
        let abort = a.abort_transaction();
        assert_eq!(abort.reason, AbortReason::Explicit);
        assert!(!a.in_transaction());

        assert_eq!(a.atomically(|t, _| t.read_word(obj, VALUE)), 5);
        assert_eq!(a.stats().aborts, 1);
    }

    #[test]
    fn abort_drops_roots_pushed_by_the_transaction() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        a.push_root(ObjRef::NULL);
        a.start_transaction();
        let obj = node(&mut a, 1, ObjRef::NULL).unwrap();
        a.push_root(obj);
        a.set_thread_local(obj);
        a.abort_transaction();
        assert_eq!(a.root_count(), 1);
        assert!(a.thread_local().is_null());
    }

    #[test]
    fn read_only_commit_publishes_nothing() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 3);
        let before = stm.commit_log.latest_rev();
        a.atomically(|t, _| t.read_word(obj, VALUE));
        assert_eq!(stm.commit_log.latest_rev(), before);
    }

    #[test]
    fn second_writer_of_an_object_aborts() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 0);

        a.start_transaction();
        a.write_word(obj, VALUE, 1).unwrap();
        b.start_transaction();
        b.write_word(obj, VALUE, 2).unwrap();
        a.commit_transaction().unwrap();

        let abort = b.commit_transaction().unwrap_err();
        assert!(matches!(
            abort.reason,
            AbortReason::RemoteAbort | AbortReason::WriteWriteConflict
        ));
        assert_eq!(b.atomically(|t, _| t.read_word(obj, VALUE)), 1);
    }

    #[test]
    fn older_reader_wins_over_younger_writer() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 0);

        a.start_transaction();
        assert_eq!(a.read_word(obj, VALUE).unwrap(), 0);
        b.start_transaction();
        b.write_word(obj, VALUE, 2).unwrap();
        let abort = b.commit_transaction().unwrap_err();
        assert_eq!(abort.reason, AbortReason::LostContention);
        a.commit_transaction().unwrap();
    }

    #[test]
    fn inevitable_writer_aborts_readers() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 0);

        a.start_transaction();
        a.read_word(obj, VALUE).unwrap();
        b.start_transaction();
        b.become_inevitable().unwrap();
        assert!(b.is_inevitable());
        b.write_word(obj, VALUE, 7).unwrap();
        b.commit_transaction().unwrap();

        let abort = a.commit_transaction().unwrap_err();
        assert_eq!(abort.reason, AbortReason::RemoteAbort);
        assert_eq!(a.atomically(|t, _| t.read_word(obj, VALUE)), 7);
        assert_eq!(b.stats().inevitable_transactions, 1);
    }

    #[test]
    #[should_panic(expected = "inevitable transaction cannot abort")]
    fn inevitable_transaction_cannot_abort() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        a.start_transaction();
        a.become_inevitable().unwrap();
        a.abort_transaction();
    }

    #[test]
    fn validation_is_idempotent() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 1);
        b.atomically(|t, _| t.read_word(obj, VALUE));
        for value in 2..5 {
            a.atomically(|t, _| t.write_word(obj, VALUE, value));
        }

        let segment = b.segment();
        let mut local = stm.slot(segment).local.lock();
        assert_eq!(validate(&stm, segment, &mut local), Ok(()));
        assert_eq!(local.last_validated, stm.commit_log.latest_rev());
        let ptr = stm.segments.memory(segment).translate(obj);
        let read = || unsafe { ptr.add(VALUE).cast::<u64>().read() };
        assert_eq!(read(), 4);
        assert_eq!(validate(&stm, segment, &mut local), Ok(()));
        assert_eq!(read(), 4);
    }

    #[test]
    fn card_write_publishes_only_its_card() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        a.atomically(|t, _| {
            let obj = blob(t, 10_000 - ITEMS)?;
            t.push_root(obj);
            Ok(())
        });
        let obj = a.peek_root(0);
        assert!(stm.layout.is_old(obj.addr()));

        let card = 5;
        let card_size = stm.settings.card_size;
        let index = card * card_size - ITEMS + 8;
        let before = stm.commit_log.latest_rev();
        a.atomically(|t, _| {
            let ptr = t.write_barrier_card(obj, index)?;
            unsafe { ptr.add(ITEMS + index).write(0xAB) };
            Ok(())
        });

        let entries = stm.commit_log_snapshot(before);
        assert_eq!(entries.len(), 1);
        let writes = &entries[0].writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].obj, obj);
        assert_eq!(writes[0].offset, card * card_size);
        assert_eq!(writes[0].bytes.len(), card_size);
        assert_eq!(writes[0].bytes[8], 0xAB);
    }

    /// Commits a card-marked blob and leaves it rooted.
    fn committed_blob(thread: &mut StmThread) -> ObjRef {
        thread.atomically(|t, _| {
            let obj = blob(t, 10_000 - ITEMS)?;
            t.push_root(obj);
            Ok(())
        });
        thread.peek_root(0)
    }

    /// Stores `value` at byte `offset` of a blob through its card barrier.
    fn card_write(t: &mut StmThread, obj: ObjRef, offset: usize, value: u8) -> StmResult<()> {
        let ptr = t.write_barrier_card(obj, offset - ITEMS)?;
        unsafe { ptr.add(offset).write(value) };
        Ok(())
    }

    fn byte_at(thread: &mut StmThread, obj: ObjRef, offset: usize) -> u8 {
        thread.atomically(|t, _| t.read_bytes(obj, offset, 1))[0]
    }

    #[test]
    fn card_abort_restores_written_cards() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_blob(&mut a);
        let card_size = stm.settings.card_size;

        a.start_transaction();
        card_write(&mut a, obj, 2 * card_size + 4, 0x11).unwrap();
        card_write(&mut a, obj, 7 * card_size, 0x22).unwrap();
        assert_eq!(a.read_bytes(obj, 2 * card_size + 4, 1).unwrap(), vec![0x11]);
        a.abort_transaction();

        assert_eq!(byte_at(&mut a, obj, 2 * card_size + 4), 0);
        assert_eq!(byte_at(&mut a, obj, 7 * card_size), 0);
        assert_eq!(byte_at(&mut b, obj, 2 * card_size + 4), 0);
    }

    #[test]
    fn full_write_after_card_write_keeps_pre_transaction_bytes() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let obj = committed_blob(&mut a);
        let card_size = stm.settings.card_size;

        a.start_transaction();
        card_write(&mut a, obj, 2 * card_size + 4, 0x11).unwrap();
        // the full backup is taken after the card write landed in the view
        a.write_bytes(obj, 4 * card_size, &[0x22; 8]).unwrap();
        a.abort_transaction();

        assert_eq!(byte_at(&mut a, obj, 2 * card_size + 4), 0);
        assert_eq!(byte_at(&mut a, obj, 4 * card_size), 0);

        a.atomically(|t, _| {
            card_write(t, obj, 2 * card_size + 4, 0x11)?;
            t.write_bytes(obj, 4 * card_size, &[0x22; 8])
        });
        assert_eq!(byte_at(&mut a, obj, 2 * card_size + 4), 0x11);
        assert_eq!(byte_at(&mut a, obj, 4 * card_size), 0x22);
    }

    #[test]
    fn disjoint_card_writers_both_commit() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_blob(&mut a);
        let card_size = stm.settings.card_size;

        b.start_transaction();
        card_write(&mut b, obj, 6 * card_size + 1, 0x66).unwrap();
        a.atomically(|t, _| card_write(t, obj, 2 * card_size + 1, 0x22));

        // validation brings in card 2 without touching b's card 6
        assert_eq!(b.read_bytes(obj, 2 * card_size + 1, 1).unwrap(), vec![0x22]);
        assert_eq!(b.read_bytes(obj, 6 * card_size + 1, 1).unwrap(), vec![0x66]);
        b.commit_transaction().unwrap();

        assert_eq!(byte_at(&mut a, obj, 2 * card_size + 1), 0x22);
        assert_eq!(byte_at(&mut a, obj, 6 * card_size + 1), 0x66);
    }

    #[test]
    fn writers_of_the_same_card_conflict() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_blob(&mut a);
        let card_size = stm.settings.card_size;

        b.start_transaction();
        card_write(&mut b, obj, 3 * card_size + 9, 0xBB).unwrap();
        a.atomically(|t, _| card_write(t, obj, 3 * card_size + 1, 0xAA));

        let abort = b.commit_transaction().unwrap_err();
        assert_eq!(abort.reason, AbortReason::WriteWriteConflict);
        // the restored card carries a's commit, not b's write
        assert_eq!(byte_at(&mut b, obj, 3 * card_size + 1), 0xAA);
        assert_eq!(byte_at(&mut b, obj, 3 * card_size + 9), 0);
    }

    #[test]
    fn remote_write_straddling_a_saved_card_is_split() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_blob(&mut a);
        let card_size = stm.settings.card_size;
        let boundary = 3 * card_size;

        b.start_transaction();
        card_write(&mut b, obj, 2 * card_size + 1, 0xBB).unwrap();
        // a full write covering the end of card 2 and the start of card 3
        a.atomically(|t, _| t.write_bytes(obj, boundary - 8, &[0xAA; 16]));

        {
            let segment = b.segment();
            let mut local = stm.slot(segment).local.lock();
            assert_eq!(
                validate(&stm, segment, &mut local),
                Err(AbortReason::WriteWriteConflict)
            );
            let view = stm.segments.memory(segment).translate(obj);
            // card 3 is not saved and got the bytes directly, card 2 still
            // shows b's uncommitted write
            assert_eq!(unsafe { view.add(boundary).read() }, 0xAA);
            assert_eq!(unsafe { view.add(boundary - 8).read() }, 0);
            assert_eq!(unsafe { view.add(2 * card_size + 1).read() }, 0xBB);
        }

        // the conflict is reported above, so roll back by hand
        b.abort_transaction();
        assert_eq!(
            b.atomically(|t, _| t.read_bytes(obj, boundary - 8, 16)),
            vec![0xAA; 16]
        );
        assert_eq!(byte_at(&mut b, obj, 2 * card_size + 1), 0);
    }

    #[test]
    fn aborted_writes_stay_invisible_to_other_segments() {
        let (stm, _) = new_stm();
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();
        let obj = committed_node(&mut a, 5);
        let data = committed_blob(&mut a);
        let card_size = stm.settings.card_size;

        a.start_transaction();
        a.write_word(obj, VALUE, 9).unwrap();
        card_write(&mut a, data, card_size, 0x11).unwrap();
        assert_eq!(b.atomically(|t, _| t.read_word(obj, VALUE)), 5);
        a.abort_transaction();

        let before = stm.commit_log.latest_rev();
        assert_eq!(b.atomically(|t, _| t.read_word(obj, VALUE)), 5);
        assert_eq!(byte_at(&mut b, data, card_size), 0);
        assert_eq!(byte_at(&mut a, data, card_size), 0);
        assert_eq!(stm.commit_log.latest_rev(), before);
    }
}
