use object::{GcFlags, Header, MIN_OBJECT_SIZE, ObjRef};

use crate::cards::{CardBackup, card_range};
use crate::error::{AbortReason, StmResult};
use crate::model::object_size;
use crate::stm::{Backup, SegmentLocal, SegmentSlot, StmInner};
use crate::thread::StmThread;

// ── Validation ────────────────────────────────────────────────────────

/// Replays every commit newer than the segment's last validated revision.
///
/// Writes to objects in our write set land in their backups instead of the
/// view. Every entry is applied even after a conflict is found, so the view
/// always ends up at the latest revision.
pub(crate) fn validate(
    stm: &StmInner,
    segment: usize,
    local: &mut SegmentLocal,
) -> Result<(), AbortReason> {
    if stm.commit_log.latest_rev() == local.last_validated {
        return Ok(());
    }
    let markers = &stm.slot(segment).markers;
    let card_size = stm.settings.card_size;
    let mut conflict = None;

    for entry in stm.commit_log.entries_after(local.last_validated) {
        debug_assert_ne!(entry.segment, segment, "own commit replayed");
        for write in &entry.writes {
            let len = write.bytes.len();
            if let Some(&idx) = local.modified.get(&write.obj) {
                local.backups[idx].bytes_mut()[write.offset..write.offset + len]
                    .copy_from_slice(&write.bytes);
                conflict.get_or_insert(AbortReason::WriteWriteConflict);
                continue;
            }
            if let Some(backup) = local.card_backups.get_mut(&write.obj) {
                if backup.overlaps(write.offset, len, card_size) {
                    apply_around_cards(stm, segment, write.obj, write.offset, &write.bytes, backup, card_size);
                    conflict.get_or_insert(AbortReason::WriteWriteConflict);
                    continue;
                }
            }
            stm.segments.apply_to_view(segment, write.start(), &write.bytes);
            if local.tx_active && markers.is_read(write.obj) {
                conflict.get_or_insert(AbortReason::ReadWriteConflict);
            }
        }
        local.last_validated = entry.rev;
    }

    match conflict {
        Some(reason) => {
            log::trace!("segment {segment}: {reason} up to rev {}", local.last_validated);
            Err(reason)
        }
        None => Ok(()),
    }
}

/// Bytes inside saved cards go to the card backup, the rest to the view.
fn apply_around_cards(
    stm: &StmInner,
    segment: usize,
    obj: ObjRef,
    offset: usize,
    bytes: &[u8],
    backup: &mut CardBackup,
    card_size: usize,
) {
    backup.absorb(offset, bytes, card_size);
    let end = offset + bytes.len();
    let mut cursor = offset;
    while cursor < end {
        let card = cursor / card_size;
        let chunk_end = end.min((card + 1) * card_size);
        if !backup.has(card) {
            stm.segments.apply_to_view(
                segment,
                obj.addr() + cursor,
                &bytes[cursor - offset..chunk_end - offset],
            );
        }
        cursor = chunk_end;
    }
}

/// Brings `obj` into the segment's view, validating first so the copy and
/// the rest of the view agree on the revision.
fn import_object(
    stm: &StmInner,
    segment: usize,
    local: &mut SegmentLocal,
    obj: ObjRef,
) -> Result<(), AbortReason> {
    let addr = obj.addr();
    let memory = stm.segments.memory(segment);
    if stm.segments.is_accessible(segment, addr, MIN_OBJECT_SIZE) {
        // SAFETY: the header page is present
        let size = unsafe { object_size(&*stm.model, memory.translate(obj)) };
        if stm.segments.is_accessible(segment, addr, size) {
            return Ok(());
        }
    }

    let lock = stm.commit_lock.lock();
    validate(stm, segment, local)?;
    let mut imported = stm.segments.import_range(&lock, segment, addr, MIN_OBJECT_SIZE);
    // SAFETY: the header page is present now
    let size = unsafe { object_size(&*stm.model, memory.translate(obj)) };
    imported += stm.segments.import_range(&lock, segment, addr, size);
    drop(lock);

    local.stats.pages_imported += imported as u64;
    Ok(())
}

/// Makes `obj` readable at the latest revision we have validated to.
fn ensure_readable(
    stm: &StmInner,
    segment: usize,
    slot: &SegmentSlot,
    local: &mut SegmentLocal,
    obj: ObjRef,
    mark: bool,
) -> Result<(), AbortReason> {
    if slot.markers.is_read(obj) {
        return Ok(());
    }
    validate(stm, segment, local)?;
    import_object(stm, segment, local, obj)?;
    if mark {
        slot.markers.mark(obj);
    }
    Ok(())
}

// ── Barriers ──────────────────────────────────────────────────────────

impl StmThread {
    #[inline(always)]
    fn barrier_fast_path_allowed(&self) -> bool {
        let stm = &*self.stm;
        !stm.sync.state.collecting() && !stm.slot(self.segment).has_pending_abort()
    }

    /// Returns a pointer to `obj` in this thread's view, consistent with
    /// everything else read in the running transaction.
    #[inline]
    pub fn read_barrier(&mut self, obj: ObjRef) -> StmResult<*const u8> {
        debug_assert!(!obj.is_null(), "read barrier on null");
        self.assert_in_transaction();
        let stm = &*self.stm;
        let ptr = stm.segments.memory(self.segment).translate(obj);
        if (stm.layout.is_young(obj.addr()) || stm.slot(self.segment).markers.is_read(obj))
            && self.barrier_fast_path_allowed()
        {
            return Ok(ptr);
        }
        self.read_slow(obj)
    }

    #[cold]
    #[inline(never)]
    fn read_slow(&mut self, obj: ObjRef) -> StmResult<*const u8> {
        self.safepoint()?;
        let segment = self.segment;
        let result = {
            let stm = &*self.stm;
            let slot = stm.slot(segment);
            let mut local = slot.local.lock();
            if local.nursery.contains(obj.addr()) {
                Ok(())
            } else {
                ensure_readable(stm, segment, slot, &mut local, obj, true)
            }
        };
        match result {
            Ok(()) => Ok(self.stm.segments.memory(segment).translate(obj)),
            Err(reason) => Err(self.abort_with(reason)),
        }
    }

    /// Returns a writable pointer to `obj` in this thread's view. The first
    /// write barrier on an old object in a transaction takes a backup.
    #[inline]
    pub fn write_barrier(&mut self, obj: ObjRef) -> StmResult<*mut u8> {
        debug_assert!(!obj.is_null(), "write barrier on null");
        self.assert_in_transaction();
        let stm = &*self.stm;
        let ptr = stm.segments.memory(self.segment).translate(obj);
        if stm.layout.is_young(obj.addr()) {
            return Ok(ptr);
        }
        // SAFETY: obj is visible in this view once its flag is cleared
        let header = unsafe { &*ptr.cast::<Header>() };
        if stm.slot(self.segment).markers.is_read(obj)
            && !header.has_flag(GcFlags::WRITE_BARRIER)
            && self.barrier_fast_path_allowed()
        {
            return Ok(ptr);
        }
        self.write_slow(obj)
    }

    #[cold]
    #[inline(never)]
    fn write_slow(&mut self, obj: ObjRef) -> StmResult<*mut u8> {
        self.safepoint()?;
        let segment = self.segment;
        let result = {
            let stm = &*self.stm;
            let slot = stm.slot(segment);
            let mut local = slot.local.lock();
            record_write(stm, segment, slot, &mut local, obj)
        };
        match result {
            Ok(()) => Ok(self.stm.segments.memory(segment).translate(obj)),
            Err(reason) => Err(self.abort_with(reason)),
        }
    }

    /// Write barrier for item `index` of a card-marked object. Only the card
    /// holding the item is backed up and published. Objects without cards
    /// fall back to [`Self::write_barrier`].
    pub fn write_barrier_card(&mut self, obj: ObjRef, index: usize) -> StmResult<*mut u8> {
        debug_assert!(!obj.is_null(), "write barrier on null");
        self.assert_in_transaction();
        let stm = &*self.stm;
        let ptr = stm.segments.memory(self.segment).translate(obj);
        if stm.layout.is_young(obj.addr()) {
            return Ok(ptr);
        }
        self.safepoint()?;
        let segment = self.segment;
        let result = {
            let stm = &*self.stm;
            let slot = stm.slot(segment);
            let mut local = slot.local.lock();
            record_card_write(stm, segment, slot, &mut local, obj, index)
        };
        match result {
            Ok(()) => Ok(self.stm.segments.memory(segment).translate(obj)),
            Err(reason) => Err(self.abort_with(reason)),
        }
    }
}

impl SegmentSlot {
    #[inline(always)]
    pub(crate) fn has_pending_abort(&self) -> bool {
        self.must_abort.load(std::sync::atomic::Ordering::Acquire) != 0
    }
}

fn record_write(
    stm: &StmInner,
    segment: usize,
    slot: &SegmentSlot,
    local: &mut SegmentLocal,
    obj: ObjRef,
) -> Result<(), AbortReason> {
    if local.nursery.contains(obj.addr()) {
        return Ok(());
    }
    let memory = stm.segments.memory(segment);

    if local.new_objects.contains(&obj) {
        // SAFETY: new objects live in this segment's view
        let header = unsafe { &*memory.translate(obj).cast::<Header>() };
        if header
            .fetch_remove_flags(GcFlags::WRITE_BARRIER)
            .contains(GcFlags::WRITE_BARRIER)
        {
            local.pointing_to_nursery.push(obj);
        }
        slot.markers.mark(obj);
        return Ok(());
    }

    ensure_readable(stm, segment, slot, local, obj, true)?;
    let ptr = memory.translate(obj);
    // SAFETY: obj was imported into this view above
    let header = unsafe { &*ptr.cast::<Header>() };

    if !local.modified.contains_key(&obj) {
        // SAFETY: obj is fully imported
        let size = unsafe { object_size(&*stm.model, ptr) };
        // SAFETY: as above
        let mut backup = unsafe { Backup::capture(ptr, size) };
        if let Some(cards) = local.card_backups.remove(&obj) {
            // the card copies predate the card writes already in the view
            // SAFETY: backup has the object's layout
            unsafe { cards.restore(backup.as_mut_ptr(), stm.settings.card_size) };
        }
        local.modified.insert(obj, local.backups.len());
        local.backups.push(backup);
        let imported = stm.privatize_range(segment, obj.addr(), size, &mut local.private_pages);
        local.stats.pages_imported += imported as u64;
    }

    if header
        .fetch_remove_flags(GcFlags::WRITE_BARRIER)
        .contains(GcFlags::WRITE_BARRIER)
    {
        local.pointing_to_nursery.push(obj);
    }
    Ok(())
}

fn record_card_write(
    stm: &StmInner,
    segment: usize,
    slot: &SegmentSlot,
    local: &mut SegmentLocal,
    obj: ObjRef,
    index: usize,
) -> Result<(), AbortReason> {
    if local.nursery.contains(obj.addr()) {
        return Ok(());
    }
    let memory = stm.segments.memory(segment);
    let card_size = stm.settings.card_size;

    let is_new = local.new_objects.contains(&obj);
    if !is_new {
        ensure_readable(stm, segment, slot, local, obj, false)?;
    }
    let ptr = memory.translate(obj);
    // SAFETY: obj is present in this view
    let header = unsafe { &*ptr.cast::<Header>() };
    if !header.has_flag(GcFlags::HAS_CARDS) {
        return record_write(stm, segment, slot, local, obj);
    }

    // SAFETY: as above
    let (size, card) = unsafe {
        let size = object_size(&*stm.model, ptr);
        let (base, item_size) = stm.model.card_base_itemsize(ptr);
        let offset = base + index * item_size;
        assert!(offset < size, "card index {index} out of bounds for {size} byte object");
        (size, offset / card_size)
    };

    if !is_new && !local.modified.contains_key(&obj) {
        let backup = local.card_backups.entry(obj).or_default();
        if !backup.has(card) {
            // SAFETY: obj is fully imported
            unsafe { backup.save(ptr, card, card_size, size) };
            let range = card_range(card, card_size, size);
            let imported = stm.privatize_range(
                segment,
                obj.addr() + range.start,
                range.len(),
                &mut local.private_pages,
            );
            local.stats.pages_imported += imported as u64;
        }
    }
    local.cards_since_minor.entry(obj).or_default().set(card);
    Ok(())
}
