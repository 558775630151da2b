use core::fmt;

/// A logical reference into the transactional heap.
///
/// The value is a byte offset from the start of the heap range. Every
/// segment maps the same range, so an `ObjRef` names the same object in
/// every segment; only the translation to a physical address differs.
/// Offset 0 is never handed out by the allocators and encodes null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct ObjRef(u64);

impl ObjRef {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr as u64)
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the reference `offset` bytes further into the heap.
    #[inline(always)]
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjRef(null)")
        } else {
            write!(f, "ObjRef({:#x})", self.0)
        }
    }
}
