mod large;
mod nursery;
mod small;

pub(crate) use large::LARGE_GRANULE;
pub(crate) use nursery::Nursery;

use large::LargeAllocator;
use object::align_object_size;
use small::SmallAllocator;

use crate::settings::HeapLayout;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepStats {
    pub freed_bytes: usize,
    pub freed_pages: usize,
}

/// Old space: large objects grow up from the start, small-object pages are
/// taken from the end going down. Shared by all segments behind one lock.
#[derive(Debug)]
pub(crate) struct OldSpace {
    start: usize,
    end: usize,
    page_size: usize,
    small_object_max: usize,
    small: SmallAllocator,
    large: LargeAllocator,
    /// lowest page handed to the small allocator
    small_floor: usize,
    free_pages: Vec<usize>,
    allocated_bytes: usize,
}

impl OldSpace {
    pub fn new(layout: &HeapLayout, small_object_max: usize) -> Self {
        Self {
            start: layout.old_start,
            end: layout.old_end,
            page_size: layout.page_size,
            small_object_max,
            small: SmallAllocator::new(layout.page_size, small_object_max),
            large: LargeAllocator::new(layout.old_start),
            small_floor: layout.old_end,
            free_pages: Vec::new(),
            allocated_bytes: 0,
        }
    }

    /// Returns the address of `size` fresh bytes, or `None` when old space
    /// is exhausted. The memory content is unspecified.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let size = align_object_size(size);
        let (addr, charged) = if size <= self.small_object_max {
            let page_size = self.page_size;
            let large_top = self.large.top();
            let small_floor = &mut self.small_floor;
            let free_pages = &mut self.free_pages;
            let mut new_page = || {
                if let Some(page) = free_pages.pop() {
                    return Some(page);
                }
                let next = small_floor.checked_sub(page_size)?;
                if next < large_top {
                    return None;
                }
                *small_floor = next;
                Some(next)
            };
            (self.small.allocate(size, &mut new_page)?, size)
        } else {
            let addr = self.large.allocate(size, self.small_floor)?;
            (addr, size.next_multiple_of(LARGE_GRANULE))
        };
        self.allocated_bytes += charged;
        log::trace!("old space: {size} bytes at {addr:#x}");
        Some(addr)
    }

    #[cfg(test)]
    pub fn owns(&self, addr: usize) -> bool {
        self.small.owns(addr) || self.large.owns(addr)
    }

    /// Frees every object whose address fails `is_live`, reporting each one
    /// to `on_free` before its memory is reused.
    pub fn sweep(
        &mut self,
        is_live: &dyn Fn(usize) -> bool,
        on_free: &mut dyn FnMut(usize, usize),
    ) -> SweepStats {
        let (small_bytes, empty_pages) = self.small.sweep(is_live, on_free);
        let large_bytes = self.large.sweep(is_live, on_free);
        let freed_pages = empty_pages.len();
        self.free_pages.extend(empty_pages);
        // lowest address on top
        self.free_pages.sort_unstable_by(|a, b| b.cmp(a));

        let freed_bytes = small_bytes + large_bytes;
        self.allocated_bytes -= freed_bytes;
        SweepStats {
            freed_bytes,
            freed_pages,
        }
    }

    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Bytes taken from old space, counting whole pages held by small
    /// classes.
    pub fn in_use_bytes(&self) -> usize {
        let small_pages = (self.end - self.small_floor) - self.free_pages.len() * self.page_size;
        small_pages + (self.large.top() - self.start)
    }

    #[inline]
    pub fn usage(&self) -> f64 {
        self.in_use_bytes() as f64 / self.capacity() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StmSettings;

    fn layout() -> HeapLayout {
        StmSettings {
            segments: 1,
            heap_size: 16 * 4096,
            nursery_size: 4096,
            ..StmSettings::default()
        }
        .layout()
    }

    #[test]
    fn small_from_top_large_from_bottom() {
        let layout = layout();
        let mut old = OldSpace::new(&layout, 256);

        let small = old.allocate(24).unwrap();
        assert_eq!(small, layout.old_end - 4096);
        let large = old.allocate(1000).unwrap();
        assert_eq!(large, layout.old_start);
        assert!(old.owns(small));
        assert!(old.owns(large));
        assert_eq!(old.allocated_bytes(), 24 + 1008);
        assert!(old.usage() > 0.0);
    }

    #[test]
    fn exhaustion_and_sweep_recovery() {
        let layout = layout();
        let mut old = OldSpace::new(&layout, 256);

        let mut objects = Vec::new();
        while let Some(addr) = old.allocate(2048) {
            objects.push(addr);
        }
        assert_eq!(objects.len(), old.capacity() / 2048);
        assert!(old.allocate(16).is_none());

        let keep = objects[0];
        let mut freed = 0;
        let stats = old.sweep(&|addr| addr == keep, &mut |_, _| freed += 1);
        assert_eq!(freed, objects.len() - 1);
        assert_eq!(stats.freed_bytes, (objects.len() - 1) * 2048);
        assert_eq!(old.allocated_bytes(), 2048);

        assert!(old.allocate(16).is_some());
        assert!(old.allocate(4096).is_some());
    }

    #[test]
    fn empty_small_pages_are_recycled() {
        let layout = layout();
        let mut old = OldSpace::new(&layout, 256);

        let a = old.allocate(16).unwrap();
        let stats = old.sweep(&|_| false, &mut |_, _| {});
        assert_eq!(stats.freed_pages, 1);

        // a different class reuses the released page
        let b = old.allocate(64).unwrap();
        assert_eq!(b, a);
    }
}
