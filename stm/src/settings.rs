use std::ops::Range;

use object::{MIN_OBJECT_SIZE, OBJECT_ALIGN};

use crate::system::OS_PAGE_SIZE;

/// Highest number of thread segments a single [`crate::Stm`] can host.
pub const MAX_SEGMENTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("sizes must be > 0")]
    ZeroSize,
    #[error("segments must be between 1 and {MAX_SEGMENTS}, got {0}")]
    SegmentCount(usize),
    #[error("page_size must be a power of two multiple of the OS page size, got {0}")]
    PageSize(usize),
    #[error("{name} must be a multiple of page_size")]
    NotPageMultiple { name: &'static str },
    #[error("heap of {heap_size} bytes cannot hold {needed} bytes of nurseries and old space")]
    HeapTooSmall { heap_size: usize, needed: usize },
    #[error("small_object_max must be a multiple of 8 in {MIN_OBJECT_SIZE}..=page_size/4, got {0}")]
    SmallObjectMax(usize),
    #[error("card_size must be a power of two >= 8, got {0}")]
    CardSize(usize),
    #[error("card_marking_min_size must exceed small_object_max")]
    CardMarkingMinSize,
    #[error("fractions must be between 0.0 and 1.0")]
    Fraction,
}

#[derive(Debug, Clone)]
pub struct StmSettings {
    /// Number of thread segments, i.e. threads that may be registered at once.
    pub segments: usize,
    /// Size of the logical heap in bytes. Every segment maps a view this large.
    pub heap_size: usize,
    /// Granularity of page sharing between segments.
    pub page_size: usize,
    /// Nursery size per segment. Must be a multiple of `page_size`.
    pub nursery_size: usize,
    /// Objects up to this size go to the size-class allocator.
    pub small_object_max: usize,
    /// Bytes covered by one card of a card-marked object.
    pub card_size: usize,
    /// Objects at least this large are card-marked.
    pub card_marking_min_size: usize,
    /// Old-space usage (0.0 - 1.0) that triggers a major collection.
    pub major_gc_threshold: f64,
    /// Retained commit-log entries that trigger a major collection, which
    /// resyncs every segment and retires the log.
    pub commit_log_limit: usize,
    /// Aborts after which `atomically` retries as an inevitable transaction.
    pub max_retries_before_inevitable: u32,
}

impl Default for StmSettings {
    fn default() -> Self {
        Self {
            segments: 4,
            heap_size: 64 * 1024 * 1024, // 64 MB
            page_size: 4096,
            nursery_size: 1024 * 1024, // 1 MB
            small_object_max: 256,
            card_size: 128,
            card_marking_min_size: 2048,
            major_gc_threshold: 0.75,
            commit_log_limit: 4096,
            max_retries_before_inevitable: 10,
        }
    }
}

impl StmSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size == 0
            || self.page_size == 0
            || self.nursery_size == 0
            || self.commit_log_limit == 0
        {
            return Err(ConfigError::ZeroSize);
        }
        if self.segments == 0 || self.segments > MAX_SEGMENTS {
            return Err(ConfigError::SegmentCount(self.segments));
        }
        if !self.page_size.is_power_of_two() || !self.page_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if !self.heap_size.is_multiple_of(self.page_size) {
            return Err(ConfigError::NotPageMultiple { name: "heap_size" });
        }
        if !self.nursery_size.is_multiple_of(self.page_size) {
            return Err(ConfigError::NotPageMultiple {
                name: "nursery_size",
            });
        }
        // null page + nurseries + a handful of old pages
        let needed = self.page_size * (1 + MIN_OLD_PAGES) + self.segments * self.nursery_size;
        if needed > self.heap_size {
            return Err(ConfigError::HeapTooSmall {
                heap_size: self.heap_size,
                needed,
            });
        }
        if !self.small_object_max.is_multiple_of(OBJECT_ALIGN)
            || self.small_object_max < MIN_OBJECT_SIZE
            || self.small_object_max > self.page_size / 4
        {
            return Err(ConfigError::SmallObjectMax(self.small_object_max));
        }
        if !self.card_size.is_power_of_two() || self.card_size < OBJECT_ALIGN {
            return Err(ConfigError::CardSize(self.card_size));
        }
        if self.card_marking_min_size <= self.small_object_max {
            return Err(ConfigError::CardMarkingMinSize);
        }
        if !(0.0..=1.0).contains(&self.major_gc_threshold) || self.major_gc_threshold == 0.0 {
            return Err(ConfigError::Fraction);
        }
        Ok(())
    }

    pub(crate) fn layout(&self) -> HeapLayout {
        let nursery_start = self.page_size;
        let old_start = nursery_start + self.segments * self.nursery_size;
        HeapLayout {
            page_size: self.page_size,
            heap_size: self.heap_size,
            nursery_start,
            nursery_size: self.nursery_size,
            old_start,
            old_end: self.heap_size,
        }
    }
}

const MIN_OLD_PAGES: usize = 4;

/// Where things live in the logical heap. Offset 0 is the null page, then
/// one nursery per thread segment, then old space up to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeapLayout {
    pub page_size: usize,
    pub heap_size: usize,
    pub nursery_start: usize,
    pub nursery_size: usize,
    pub old_start: usize,
    pub old_end: usize,
}

impl HeapLayout {
    /// Nursery of thread segment `segment` (1-based).
    #[inline]
    pub fn nursery(&self, segment: usize) -> Range<usize> {
        debug_assert!(segment >= 1);
        let start = self.nursery_start + (segment - 1) * self.nursery_size;
        start..start + self.nursery_size
    }

    #[inline(always)]
    pub fn is_young(&self, addr: usize) -> bool {
        addr >= self.nursery_start && addr < self.old_start
    }

    #[inline(always)]
    pub fn is_old(&self, addr: usize) -> bool {
        addr >= self.old_start && addr < self.old_end
    }

    #[inline(always)]
    pub fn page_of(&self, addr: usize) -> usize {
        addr / self.page_size
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.heap_size / self.page_size
    }

    /// Pages touched by `addr..addr + len`.
    #[inline]
    pub fn pages_spanned(&self, addr: usize, len: usize) -> Range<usize> {
        debug_assert!(len > 0);
        self.page_of(addr)..self.page_of(addr + len - 1) + 1
    }

    #[inline]
    pub fn old_pages(&self) -> Range<usize> {
        self.page_of(self.old_start)..self.page_of(self.old_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert_eq!(StmSettings::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_settings() {
        let base = StmSettings::default();

        let s = StmSettings {
            segments: 0,
            ..base.clone()
        };
        assert_eq!(s.validate(), Err(ConfigError::SegmentCount(0)));

        let s = StmSettings {
            page_size: 3000,
            ..base.clone()
        };
        assert_eq!(s.validate(), Err(ConfigError::PageSize(3000)));

        let s = StmSettings {
            nursery_size: 5000,
            ..base.clone()
        };
        assert!(matches!(
            s.validate(),
            Err(ConfigError::NotPageMultiple { .. })
        ));

        let s = StmSettings {
            heap_size: 4096 * 8,
            ..base.clone()
        };
        assert!(matches!(s.validate(), Err(ConfigError::HeapTooSmall { .. })));

        let s = StmSettings {
            small_object_max: 20,
            ..base.clone()
        };
        assert_eq!(s.validate(), Err(ConfigError::SmallObjectMax(20)));

        let s = StmSettings {
            card_size: 100,
            ..base.clone()
        };
        assert_eq!(s.validate(), Err(ConfigError::CardSize(100)));

        let s = StmSettings {
            card_marking_min_size: 128,
            ..base.clone()
        };
        assert_eq!(s.validate(), Err(ConfigError::CardMarkingMinSize));

        let s = StmSettings {
            major_gc_threshold: 1.5,
            ..base.clone()
        };
        assert_eq!(s.validate(), Err(ConfigError::Fraction));

        let s = StmSettings {
            commit_log_limit: 0,
            ..base
        };
        assert_eq!(s.validate(), Err(ConfigError::ZeroSize));
    }

    #[test]
    fn layout_partitions_heap() {
        let settings = StmSettings::default();
        let layout = settings.layout();

        assert_eq!(layout.nursery_start, settings.page_size);
        assert_eq!(layout.nursery(1).start, settings.page_size);
        assert_eq!(layout.nursery(2).start, layout.nursery(1).end);
        assert_eq!(layout.nursery(settings.segments).end, layout.old_start);

        assert!(!layout.is_young(0));
        assert!(layout.is_young(layout.nursery(3).start + 16));
        assert!(!layout.is_young(layout.old_start));
        assert!(layout.is_old(layout.old_start));
        assert!(!layout.is_old(layout.old_end));

        assert_eq!(layout.pages_spanned(4096, 1), 1..2);
        assert_eq!(layout.pages_spanned(4000, 200), 0..2);
        assert_eq!(layout.page_count(), settings.heap_size / settings.page_size);
    }
}
