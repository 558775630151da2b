use ahash::AHashMap;
use object::{MIN_OBJECT_SIZE, OBJECT_ALIGN};

/// A page carved into equal slots of one size class.
#[derive(Debug)]
struct SmallPage {
    class: usize,
    allocated: Vec<u64>,
    live: usize,
}

impl SmallPage {
    fn new(class: usize, slots: usize) -> Self {
        Self {
            class,
            allocated: vec![0; slots.div_ceil(64)],
            live: 0,
        }
    }

    #[inline(always)]
    fn is_set(&self, slot: usize) -> bool {
        self.allocated[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline(always)]
    fn set(&mut self, slot: usize) {
        self.allocated[slot / 64] |= 1 << (slot % 64);
        self.live += 1;
    }

    #[inline(always)]
    fn clear(&mut self, slot: usize) {
        self.allocated[slot / 64] &= !(1 << (slot % 64));
        self.live -= 1;
    }
}

/// Segregated size classes (multiples of 8) for objects up to
/// `small_object_max`.
#[derive(Debug)]
pub(crate) struct SmallAllocator {
    page_size: usize,
    /// free slot addresses per class, lowest address on top
    free: Vec<Vec<usize>>,
    pages: AHashMap<usize, SmallPage>,
}

impl SmallAllocator {
    pub fn new(page_size: usize, small_object_max: usize) -> Self {
        let classes = Self::class_of(small_object_max) + 1;
        Self {
            page_size,
            free: vec![Vec::new(); classes],
            pages: AHashMap::new(),
        }
    }

    #[inline(always)]
    fn class_of(size: usize) -> usize {
        debug_assert!(size >= MIN_OBJECT_SIZE && size.is_multiple_of(OBJECT_ALIGN));
        (size - MIN_OBJECT_SIZE) / OBJECT_ALIGN
    }

    #[inline(always)]
    fn class_size(class: usize) -> usize {
        MIN_OBJECT_SIZE + class * OBJECT_ALIGN
    }

    #[inline(always)]
    fn slots_per_page(&self, class: usize) -> usize {
        self.page_size / Self::class_size(class)
    }

    #[inline(always)]
    fn page_start(&self, addr: usize) -> usize {
        addr - addr % self.page_size
    }

    /// Returns a slot for `size`, asking `new_page` for a fresh page when the
    /// class has no free slot left.
    pub fn allocate(
        &mut self,
        size: usize,
        new_page: &mut dyn FnMut() -> Option<usize>,
    ) -> Option<usize> {
        let class = Self::class_of(size);
        if self.free[class].is_empty() {
            let page = new_page()?;
            self.adopt_page(page, class);
        }
        let addr = self.free[class].pop()?;
        let page_start = self.page_start(addr);
        let slot = (addr - page_start) / Self::class_size(class);
        let page = self
            .pages
            .get_mut(&page_start)
            .expect("free slot on unknown page");
        debug_assert!(!page.is_set(slot));
        page.set(slot);
        Some(addr)
    }

    fn adopt_page(&mut self, page_start: usize, class: usize) {
        let slots = self.slots_per_page(class);
        let size = Self::class_size(class);
        self.pages.insert(page_start, SmallPage::new(class, slots));
        let free = &mut self.free[class];
        free.extend((0..slots).rev().map(|slot| page_start + slot * size));
    }

    #[cfg(test)]
    pub fn owns(&self, addr: usize) -> bool {
        self.pages.contains_key(&self.page_start(addr))
    }

    /// Frees every allocated slot for which `is_live` is false. Pages left
    /// without live slots are returned to the caller.
    pub fn sweep(
        &mut self,
        is_live: &dyn Fn(usize) -> bool,
        on_free: &mut dyn FnMut(usize, usize),
    ) -> (usize, Vec<usize>) {
        let mut freed_bytes = 0;
        let mut empty_pages = Vec::new();

        for (&page_start, page) in self.pages.iter_mut() {
            let size = Self::class_size(page.class);
            let slots = self.page_size / size;
            for slot in 0..slots {
                if !page.is_set(slot) {
                    continue;
                }
                let addr = page_start + slot * size;
                if !is_live(addr) {
                    page.clear(slot);
                    freed_bytes += size;
                    on_free(addr, size);
                }
            }
            if page.live == 0 {
                empty_pages.push(page_start);
            }
        }

        for page_start in &empty_pages {
            self.pages.remove(page_start);
        }
        self.rebuild_free_lists();
        empty_pages.sort_unstable();
        (freed_bytes, empty_pages)
    }

    fn rebuild_free_lists(&mut self) {
        for list in self.free.iter_mut() {
            list.clear();
        }
        let mut starts: Vec<usize> = self.pages.keys().copied().collect();
        starts.sort_unstable_by(|a, b| b.cmp(a));
        for page_start in starts {
            let page = &self.pages[&page_start];
            let size = Self::class_size(page.class);
            let slots = self.page_size / size;
            let free = &mut self.free[page.class];
            free.extend(
                (0..slots)
                    .rev()
                    .filter(|&slot| !page.is_set(slot))
                    .map(|slot| page_start + slot * size),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn slots_come_from_class_pages() {
        let mut small = SmallAllocator::new(PAGE, 256);
        let mut pages = vec![3 * PAGE, 2 * PAGE];
        let mut new_page = || pages.pop();

        let a = small.allocate(16, &mut new_page).unwrap();
        let b = small.allocate(16, &mut new_page).unwrap();
        assert_eq!(a, 2 * PAGE);
        assert_eq!(b, 2 * PAGE + 16);

        // different class gets its own page
        let c = small.allocate(24, &mut new_page).unwrap();
        assert_eq!(c, 3 * PAGE);
        assert!(small.owns(c + 100));
        assert!(!small.owns(4 * PAGE));

        assert_eq!(small.allocate(32, &mut new_page), None);
    }

    #[test]
    fn sweep_frees_dead_slots_and_empty_pages() {
        let mut small = SmallAllocator::new(PAGE, 256);
        let mut pages = vec![5 * PAGE, 4 * PAGE];
        let mut new_page = || pages.pop();

        let live = small.allocate(64, &mut new_page).unwrap();
        let dead = small.allocate(64, &mut new_page).unwrap();
        let lonely = small.allocate(128, &mut new_page).unwrap();

        let mut freed = Vec::new();
        let (bytes, empty) = small.sweep(&|addr| addr == live, &mut |addr, size| {
            freed.push((addr, size))
        });

        freed.sort_unstable();
        assert_eq!(freed, vec![(dead, 64), (lonely, 128)]);
        assert_eq!(bytes, 192);
        assert_eq!(empty, vec![5 * PAGE]);
        assert!(!small.owns(lonely));

        // the dead slot is handed out again first
        let mut no_pages = || None;
        assert_eq!(small.allocate(64, &mut no_pages), Some(dead));
    }
}
