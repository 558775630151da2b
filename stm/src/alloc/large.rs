use std::collections::BTreeMap;

/// Bookkeeping granule of large allocations.
pub(crate) const LARGE_GRANULE: usize = 16;

/// Address-ordered first-fit allocator growing up from the start of old
/// space.
#[derive(Debug)]
pub(crate) struct LargeAllocator {
    top: usize,
    /// start -> length
    free: BTreeMap<usize, usize>,
    /// start -> length
    allocated: BTreeMap<usize, usize>,
}

impl LargeAllocator {
    pub fn new(start: usize) -> Self {
        Self {
            top: start,
            free: BTreeMap::new(),
            allocated: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    /// Allocates `size` bytes below `limit`.
    pub fn allocate(&mut self, size: usize, limit: usize) -> Option<usize> {
        let size = size.next_multiple_of(LARGE_GRANULE);

        let fit = self
            .free
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&start, &len)| (start, len));

        let addr = if let Some((start, len)) = fit {
            self.free.remove(&start);
            if len > size {
                self.free.insert(start + size, len - size);
            }
            start
        } else {
            let end = self.top.checked_add(size)?;
            if end > limit {
                return None;
            }
            let start = self.top;
            self.top = end;
            start
        };
        self.allocated.insert(addr, size);
        Some(addr)
    }

    /// Returns the chunk to the free list, coalescing with its neighbours.
    pub fn free(&mut self, addr: usize) -> usize {
        let size = self
            .allocated
            .remove(&addr)
            .expect("freeing unallocated large chunk");
        let mut start = addr;
        let mut len = size;

        let before = self.free.range(..start).next_back().map(|(&s, &l)| (s, l));
        if let Some((prev, prev_len)) = before {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == self.top {
            self.top = start;
        } else {
            self.free.insert(start, len);
        }
        size
    }

    #[cfg(test)]
    pub fn owns(&self, addr: usize) -> bool {
        self.allocated.contains_key(&addr)
    }

    pub fn sweep(
        &mut self,
        is_live: &dyn Fn(usize) -> bool,
        on_free: &mut dyn FnMut(usize, usize),
    ) -> usize {
        let dead: Vec<usize> = self
            .allocated
            .keys()
            .copied()
            .filter(|&addr| !is_live(addr))
            .collect();
        let mut freed = 0;
        for addr in dead {
            let size = self.free(addr);
            on_free(addr, size);
            freed += size;
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_and_splits() {
        let mut large = LargeAllocator::new(1000);
        let a = large.allocate(300, 10_000).unwrap();
        let b = large.allocate(500, 10_000).unwrap();
        let _c = large.allocate(100, 10_000).unwrap();
        assert_eq!(a, 1000);
        assert_eq!(b, 1000 + 304);

        assert_eq!(large.free(b), 512);
        let d = large.allocate(200, 10_000).unwrap();
        assert_eq!(d, b);
        let e = large.allocate(300, 10_000).unwrap();
        assert_eq!(e, b + 208);
    }

    #[test]
    fn coalescing_lowers_top() {
        let mut large = LargeAllocator::new(0);
        let a = large.allocate(64, 1024).unwrap();
        let b = large.allocate(64, 1024).unwrap();
        let c = large.allocate(64, 1024).unwrap();
        assert_eq!(large.top(), 192);

        large.free(a);
        large.free(c);
        assert_eq!(large.top(), 128);
        large.free(b);
        assert_eq!(large.top(), 0);
        assert!(large.free.is_empty());
    }

    #[test]
    fn respects_limit() {
        let mut large = LargeAllocator::new(0);
        assert!(large.allocate(512, 1024).is_some());
        assert!(large.allocate(600, 1024).is_none());
        assert!(large.allocate(512, 1024).is_some());
    }

    #[test]
    fn sweep_frees_dead_chunks() {
        let mut large = LargeAllocator::new(0);
        let a = large.allocate(64, 1024).unwrap();
        let b = large.allocate(64, 1024).unwrap();
        let mut freed = Vec::new();
        let bytes = large.sweep(&|addr| addr == b, &mut |addr, _| freed.push(addr));
        assert_eq!(bytes, 64);
        assert_eq!(freed, vec![a]);
        assert!(large.owns(b));
        assert!(!large.owns(a));
    }
}
