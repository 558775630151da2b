use std::collections::BTreeMap;
use std::ops::Range;

/// Byte range of `card` inside an object of `object_size` bytes.
#[inline]
pub(crate) fn card_range(card: usize, card_size: usize, object_size: usize) -> Range<usize> {
    let start = card * card_size;
    start..object_size.min(start + card_size)
}

/// Dense bitset of card indices.
#[derive(Debug, Default, Clone)]
pub(crate) struct CardSet {
    bits: Vec<u64>,
}

impl CardSet {
    #[inline]
    pub fn set(&mut self, card: usize) -> bool {
        let word = card / 64;
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        let mask = 1 << (card % 64);
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }

    #[inline]
    pub fn contains(&self, card: usize) -> bool {
        self.bits
            .get(card / 64)
            .is_some_and(|w| w & (1 << (card % 64)) != 0)
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(i, &word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i * 64 + bit)
        })
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }
}

/// Pre-transaction bytes of the cards written so far in one object.
#[derive(Debug, Default)]
pub(crate) struct CardBackup {
    pub cards: BTreeMap<usize, Box<[u8]>>,
}

impl CardBackup {
    pub fn has(&self, card: usize) -> bool {
        self.cards.contains_key(&card)
    }

    /// # Safety
    /// `obj` points at `object_size` readable bytes.
    pub unsafe fn save(&mut self, obj: *const u8, card: usize, card_size: usize, object_size: usize) {
        if self.has(card) {
            return;
        }
        let range = card_range(card, card_size, object_size);
        // SAFETY: range is inside the object
        let bytes = unsafe { std::slice::from_raw_parts(obj.add(range.start), range.len()) };
        self.cards.insert(card, bytes.into());
    }

    /// Copies the saved bytes back over the object.
    ///
    /// # Safety
    /// `obj` points at the writable object the backup was taken from.
    pub unsafe fn restore(&self, obj: *mut u8, card_size: usize) {
        for (&card, bytes) in &self.cards {
            // SAFETY: saved from the same object
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), obj.add(card * card_size), bytes.len())
            };
        }
    }

    /// Writes `bytes` landing at object offset `offset` into the saved cards
    /// they overlap. Returns true if any saved card was touched.
    pub fn absorb(&mut self, offset: usize, bytes: &[u8], card_size: usize) -> bool {
        let end = offset + bytes.len();
        let mut touched = false;
        for (&card, saved) in self.cards.iter_mut() {
            let start = card * card_size;
            let stop = start + saved.len();
            let lo = offset.max(start);
            let hi = end.min(stop);
            if lo < hi {
                saved[lo - start..hi - start].copy_from_slice(&bytes[lo - offset..hi - offset]);
                touched = true;
            }
        }
        touched
    }

    /// Whether `offset..offset + len` overlaps a saved card.
    pub fn overlaps(&self, offset: usize, len: usize, card_size: usize) -> bool {
        let first = offset / card_size;
        let last = (offset + len - 1) / card_size;
        self.cards.range(first..=last).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_set_bits() {
        let mut set = CardSet::default();
        assert!(set.is_empty());
        assert!(set.set(5));
        assert!(!set.set(5));
        assert!(set.set(130));
        assert!(set.contains(5));
        assert!(!set.contains(6));
        assert!(!set.contains(1000));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![5, 130]);
    }

    #[test]
    fn last_card_is_clipped() {
        assert_eq!(card_range(0, 128, 300), 0..128);
        assert_eq!(card_range(2, 128, 300), 256..300);
    }

    #[test]
    fn backup_save_absorb_restore() {
        let mut object = vec![0u8; 300];
        let mut backup = CardBackup::default();
        unsafe { backup.save(object.as_ptr(), 1, 128, 300) };
        assert!(backup.has(1));
        assert!(backup.overlaps(200, 100, 128));
        assert!(!backup.overlaps(0, 128, 128));

        // a remote commit of bytes 250..260 lands partly in card 1
        assert!(backup.absorb(250, &[7; 10], 128));
        assert!(!backup.absorb(0, &[1; 8], 128));

        object[130] = 42;
        unsafe { backup.restore(object.as_mut_ptr(), 128) };
        assert_eq!(object[130], 0);
        assert_eq!(object[250], 7);
        assert_eq!(object[255], 7);
        assert_eq!(object[256], 0);
    }
}
