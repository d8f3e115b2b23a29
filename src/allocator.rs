//! Backing storage for the pool.
//!
//! The pool asks its [`Allocator`] for one contiguous region exactly once, at
//! build time, and carves it into fixed-size descriptor payload areas. The
//! region is handed back when the last handle to the pool is dropped.
//! [`DefaultAllocator`] draws the region from the global allocator;
//! [`StaticRegion`] hands out caller-provided static memory such as a linker
//! section or a DMA window.

use std::alloc::{Layout, alloc, dealloc};

use spin::Mutex;

use crate::error::{Error, Result};

/// Alignment of every region returned by [`DefaultAllocator`].
pub const REGION_ALIGN: usize = 64;

/// Trait for pool storage backends.
///
/// # Safety
///
/// Implementations must ensure:
/// - `allocate` returns a valid pointer to at least `size` writable bytes
/// - `deallocate` is only called with pointers previously returned by `allocate`
/// - The memory remains valid until `deallocate` is called
///
/// # Example
///
/// ```rust
/// use netbuf_pool::{Allocator, Result};
///
/// struct DmaWindow;
///
/// impl Allocator for DmaWindow {
///     fn allocate(&self, size: usize) -> Result<*mut u8> {
///         // Map device-visible memory here
///         # unimplemented!()
///     }
///
///     unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
///         // Unmap
///         # unimplemented!()
///     }
/// }
/// ```
pub trait Allocator: Send + Sync {
    /// Allocates a region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the region cannot be provided.
    fn allocate(&self, size: usize) -> Result<*mut u8>;

    /// Releases a region previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `ptr` was returned by a previous call to `allocate` on this allocator
    /// - `size` matches the size passed to the original `allocate` call
    /// - The memory has not already been deallocated
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize);
}

/// Allocator backed by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl DefaultAllocator {
    /// Creates a new default allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(Error::OutOfMemory);
        }

        let layout =
            Layout::from_size_align(size, REGION_ALIGN).map_err(|_| Error::OutOfMemory)?;

        // SAFETY: layout has a non-zero size and a power-of-two alignment
        let ptr = unsafe { alloc(layout) };

        if ptr.is_null() {
            Err(Error::OutOfMemory)
        } else {
            Ok(ptr)
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        if size == 0 || ptr.is_null() {
            return;
        }

        if let Ok(layout) = Layout::from_size_align(size, REGION_ALIGN) {
            // SAFETY: ptr was allocated with this layout by allocate()
            unsafe { dealloc(ptr, layout) };
        }
    }
}

/// Allocator that hands out one caller-provided static region.
///
/// The region can be claimed once; later requests fail with
/// [`Error::OutOfMemory`]. Deallocation only marks the region claimable again.
pub struct StaticRegion {
    region: Mutex<Option<&'static mut [u8]>>,
    base: *mut u8,
    len: usize,
}

// SAFETY: the region is only reachable through the mutex-guarded slot, and the
// raw base pointer is used for identity comparison only.
unsafe impl Send for StaticRegion {}
unsafe impl Sync for StaticRegion {}

impl StaticRegion {
    /// Wraps a static region.
    pub fn new(region: &'static mut [u8]) -> Self {
        let base = region.as_mut_ptr();
        let len = region.len();
        Self {
            region: Mutex::new(Some(region)),
            base,
            len,
        }
    }

    /// Size of the wrapped region in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the wrapped region is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Allocator for StaticRegion {
    fn allocate(&self, size: usize) -> Result<*mut u8> {
        let mut slot = self.region.lock();
        match slot.take() {
            Some(region) if size > 0 && size <= region.len() => Ok(region.as_mut_ptr()),
            other => {
                *slot = other;
                Err(Error::OutOfMemory)
            }
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, _size: usize) {
        if ptr != self.base {
            return;
        }
        let mut slot = self.region.lock();
        if slot.is_none() {
            // SAFETY: the region was produced from a `&'static mut [u8]` of
            // this base and length and the caller has stopped using it
            *slot = Some(unsafe { std::slice::from_raw_parts_mut(self.base, self.len) });
        }
    }
}
