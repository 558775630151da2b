use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    const PROT_READ: i32 = 0x1;
    const PROT_WRITE: i32 = 0x2;
    const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(not(target_os = "linux"))]
    const MAP_NORESERVE: i32 = 0x40;

    #[cfg(target_os = "linux")]
    const MADV_DONTNEED: i32 = 4;

    const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        fn munmap(addr: *mut c_void, length: usize) -> i32;

        #[cfg(target_os = "linux")]
        fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// Reserves zero-filled memory; physical pages appear on first touch.
    /// Null on failure.
    #[inline]
    pub fn reserve(len: usize) -> *mut u8 {
        // SAFETY: fresh anonymous mapping, no existing memory is touched
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// `ptr..ptr + len` is a whole mapping returned by [`reserve`].
    #[inline]
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        // SAFETY: forwarded to the caller
        let _ = unsafe { munmap(ptr.cast(), len) };
    }

    /// # Safety
    /// The range lies inside one mapping returned by [`reserve`].
    #[cfg(target_os = "linux")]
    #[inline]
    pub unsafe fn discard(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: forwarded to the caller
        unsafe { madvise(ptr.cast(), len, MADV_DONTNEED) == 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    NonNull::new(unix::reserve(size))
}

#[cfg(unix)]
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: segments unmap exactly what map_memory gave them
    unsafe { unix::release(ptr.as_ptr(), size) };
}

/// Releases the physical pages behind `ptr..ptr + size`. The range stays
/// mapped and reads back as zeroes.
#[cfg(unix)]
pub fn discard_memory(ptr: NonNull<u8>, size: usize) {
    // only Linux guarantees zero-fill after MADV_DONTNEED
    #[cfg(target_os = "linux")]
    {
        // SAFETY: callers pass page-aligned ranges inside a segment mapping
        if unsafe { unix::discard(ptr.as_ptr(), size) } {
            return;
        }
    }
    // SAFETY: range is inside a live mapping
    unsafe { ptr.as_ptr().write_bytes(0, size) };
}

#[cfg(not(unix))]
fn layout_for(size: usize) -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE)
        .expect("mapping size overflows a layout")
}

#[cfg(not(unix))]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: layout has a non-zero size
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout_for(size)) })
}

#[cfg(not(unix))]
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr came from map_memory with the same size
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout_for(size)) };
}

#[cfg(not(unix))]
pub fn discard_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: range is inside a live mapping
    unsafe { ptr.as_ptr().write_bytes(0, size) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_memory_is_zeroed_and_discardable() {
        let size = 4 * OS_PAGE_SIZE;
        let ptr = map_memory(size).expect("map");
        assert_eq!(ptr.as_ptr() as usize % OS_PAGE_SIZE, 0);

        unsafe {
            assert_eq!(*ptr.as_ptr().add(OS_PAGE_SIZE + 3), 0);
            ptr.as_ptr().add(OS_PAGE_SIZE).write_bytes(0xAB, OS_PAGE_SIZE);
            assert_eq!(*ptr.as_ptr().add(OS_PAGE_SIZE + 3), 0xAB);
        }

        let page = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(OS_PAGE_SIZE)) };
        discard_memory(page, OS_PAGE_SIZE);
        unsafe {
            assert_eq!(*ptr.as_ptr().add(OS_PAGE_SIZE + 3), 0);
        }

        unmap_memory(ptr, size);
    }
}
