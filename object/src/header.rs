use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

/// Size of the header in front of every object.
pub const HEADER_SIZE: usize = 8;
/// Every object starts on this boundary and is a multiple of it in size.
pub const OBJECT_ALIGN: usize = 8;
/// Smallest allocation. Leaves room for a forwarding reference after the
/// header when a young object is moved.
pub const MIN_OBJECT_SIZE: usize = HEADER_SIZE + 8;

/// Type id reserved for engine-managed weak references.
pub const WEAKREF_TYPE_ID: u16 = u16::MAX;
/// Header plus the single weak target slot.
pub const WEAKREF_SIZE: usize = HEADER_SIZE + 8;

/// Rounds a requested size up to a legal object size.
#[inline(always)]
pub const fn align_object_size(size: usize) -> usize {
    let size = if size < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        size
    };
    (size + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1)
}

bitflags! {
    /// Per-object GC and barrier state.
    ///
    /// Flags live in each segment's copy of the header, so clearing
    /// `WRITE_BARRIER` in one segment does not affect any other.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcFlags: u8 {
        /// Writes must go through the write barrier first.
        const WRITE_BARRIER = 1 << 0;
        /// The object is big enough to carry a card table.
        const HAS_CARDS = 1 << 1;
        /// Engine-managed weak reference.
        const WEAKREF = 1 << 2;
        /// A regular finalizer is registered.
        const FINALIZER = 1 << 3;
        /// A light finalizer is registered.
        const LIGHT_FINALIZER = 1 << 4;
        /// Young object already copied out of the nursery; the new
        /// location is stored right after the header.
        const FORWARDED = 1 << 5;
    }
}

/// The 8-byte header at the start of every object.
///
/// ```text
/// byte 0:    flags (atomic) : WriteBarrier | HasCards | WeakRef | ...
/// byte 1:    reserved (zero)
/// bytes 2‥3: client type id
/// bytes 4‥7: auxiliary word, free for the client
/// ```
#[repr(C)]
pub struct Header {
    flags: AtomicU8,
    _reserved: u8,
    type_id: u16,
    aux: u32,
}

const _: () = assert!(size_of::<Header>() == HEADER_SIZE);

impl Header {
    pub fn new(type_id: u16) -> Self {
        Self::with_flags(type_id, GcFlags::empty())
    }

    pub fn with_flags(type_id: u16, flags: GcFlags) -> Self {
        Self {
            flags: AtomicU8::new(flags.bits()),
            _reserved: 0,
            type_id,
            aux: 0,
        }
    }

    #[inline(always)]
    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    #[inline(always)]
    pub fn aux(&self) -> u32 {
        self.aux
    }

    #[inline(always)]
    pub fn set_aux(&mut self, aux: u32) {
        self.aux = aux;
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> GcFlags {
        GcFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_flags(&self, flags: GcFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: GcFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: GcFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: GcFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    /// Atomically clear flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_remove_flags(&self, flag: GcFlags) -> GcFlags {
        GcFlags::from_bits_retain(
            self.flags.fetch_and(!flag.bits(), Ordering::Relaxed),
        )
    }

    #[inline(always)]
    pub fn is_weakref(&self) -> bool {
        self.type_id == WEAKREF_TYPE_ID
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type_id", &self.type_id)
            .field("flags", &self.flags())
            .field("aux", &self.aux)
            .finish()
    }
}
