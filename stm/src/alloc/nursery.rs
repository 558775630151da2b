use std::ops::Range;

/// Bump allocator over one segment's nursery range.
#[derive(Debug)]
pub(crate) struct Nursery {
    start: usize,
    end: usize,
    top: usize,
}

impl Nursery {
    pub fn new(range: Range<usize>) -> Self {
        Self {
            start: range.start,
            end: range.end,
            top: range.start,
        }
    }

    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let addr = self.top;
        let next = addr.checked_add(size)?;
        if next > self.end {
            return None;
        }
        self.top = next;
        Some(addr)
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.top
    }

    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    #[cfg(test)]
    pub fn used(&self) -> usize {
        self.top - self.start
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == self.start
    }

    pub fn reset(&mut self) {
        self.top = self.start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_reset() {
        let mut nursery = Nursery::new(4096..4096 + 64);
        assert!(nursery.is_empty());

        assert_eq!(nursery.allocate(16), Some(4096));
        assert_eq!(nursery.allocate(32), Some(4112));
        assert!(nursery.contains(4112));
        assert!(!nursery.contains(4144));
        assert_eq!(nursery.allocate(32), None);
        assert_eq!(nursery.allocate(16), Some(4144));
        assert_eq!(nursery.used(), 64);

        nursery.reset();
        assert!(nursery.is_empty());
        assert!(!nursery.contains(4096));
        assert_eq!(nursery.allocate(64), Some(4096));
    }
}
