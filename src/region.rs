//! Views over the shared memory segment.
//!
//! [`Region`] is an unsafe window onto externally owned memory (the mapped
//! segment both processors see). [`HeapRegion`] is an owned, zeroed
//! allocation with the same alignment guarantees, used for in-process
//! transports and tests.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment of every structure placed in a segment.
pub const SEGMENT_ALIGN: usize = 64;

/// Bounds-carrying window onto the shared segment.
///
/// Copies of a `Region` are plain (pointer, length) pairs; nothing here owns
/// the memory. Ring and header views are carved out of it by byte offset.
///
/// # Safety
///
/// Whoever constructs the first `Region` guarantees `base` is mapped and
/// writable for `len` bytes, [`SEGMENT_ALIGN`]-aligned, and stays mapped for
/// as long as any copy (or any view derived from one) is alive.
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Wrap a raw mapping in a region.
    ///
    /// # Safety
    ///
    /// The struct-level contract above applies: `base` valid and
    /// [`SEGMENT_ALIGN`]-aligned for `len` bytes, outliving every copy.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        let base = NonNull::new(base).expect("null segment base");
        Self { base, len }
    }

    /// Base pointer of the window.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Window length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window covers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to byte `off` of the window.
    ///
    /// # Panics
    ///
    /// Panics if `off` is not inside the window.
    #[inline]
    pub fn offset(&self, off: usize) -> *mut u8 {
        assert!(off < self.len, "offset {off} past end of {}-byte region", self.len);
        // SAFETY: off is in bounds and the base pointer covers the window.
        unsafe { self.as_ptr().add(off) }
    }
}

// SAFETY: Region is a plain pointer+length pair; all contained structures
// synchronize through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Heap-backed region for in-process segments and tests.
///
/// Memory is zeroed on allocation, matching the boot-time state of a real
/// shared segment.
pub struct HeapRegion {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapRegion {
    /// Allocate a zeroed region of `len` bytes aligned to [`SEGMENT_ALIGN`].
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or the allocation fails.
    pub fn new_zeroed(len: usize) -> Self {
        assert!(len > 0, "region length must be non-zero");
        let layout = Layout::from_size_align(len, SEGMENT_ALIGN).expect("invalid region layout");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).expect("region allocation failed");
        Self { base, len, layout }
    }

    /// Returns a `Region` view of this allocation.
    ///
    /// The view is only valid while `self` is alive; keep the `HeapRegion`
    /// alongside anything holding the view.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: base is valid for len bytes and aligned; lifetime is
        // managed by the caller keeping this HeapRegion alive.
        unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
    }

    /// Allocation size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation covers zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with the stored layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

// SAFETY: the allocation is plain bytes; synchronization is up to the
// structures placed inside it.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}
