//! Allocator

use core::{
    alloc::{GlobalAlloc, Layout},
    cmp,
    ptr::{self, NonNull},
};

use flmalloc_core::{Config, SizeClass, Stats};

use crate::instance;
use crate::platform::FlConfig;

/// Hardened memory allocator.
///
/// A drop-in replacement for the regular allocator, serving size-classed requests out of buddy-managed Regions, with
/// tombstoning of freed memory by default.
#[derive(Default)]
pub struct FlAllocator;

impl FlAllocator {
    /// Creates an instance.
    pub const fn new() -> Self { Self }

    /// Prepares the calling thread's Arena for allocation.
    ///
    /// Returns Ok if the attempt succeeded, Err otherwise.
    ///
    /// Failure may occur if the kernel cannot map the Arena's metadata, or its eagerly provisioned chains.
    #[cold]
    pub fn warm_up(&self) -> Result<(), ()> {
        instance::with(|_| ()).ok_or(())
    }

    /// Allocates `layout.size()` bytes of memory, aligned on at least a `layout.align()` boundary.
    ///
    /// Alignments above one page are not supported, and yield None.
    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.align().count_ones() == 1);

        if layout.align() > FlConfig::PAGE_SIZE.value() {
            return None;
        }

        //  Buddy blocks are aligned to their own power-of-2 length; requesting at least `align` bytes guarantees the
        //  boundary up to one page.
        let size = cmp::max(layout.size(), layout.align());

        instance::with(|arena| arena.push(size))
            .filter(|span| span.is_allocation())
            .and_then(|span| NonNull::new(span.ptr))
    }

    /// Deallocates the memory located at `pointer`, honoring the deletion policy: recycled under hard-free,
    /// tombstoned under the default policy.
    ///
    /// #   Safety
    ///
    /// -   Assumes `pointer` has been returned by a prior call to `allocate`.
    /// -   Assumes `pointer` has not been deallocated since its allocation.
    /// -   Assumes the memory pointed by `pointer` is no longer in use.
    pub unsafe fn deallocate(&self, pointer: NonNull<u8>) {
        instance::with(|arena| arena.pop(pointer.as_ptr()));
    }

    /// Deallocates the memory located at `pointer` by tombstoning it, whatever the deletion policy.
    ///
    /// Returns whether a live allocation was retired.
    ///
    /// #   Safety
    ///
    /// -   Assumes the memory pointed by `pointer` is no longer in use.
    pub unsafe fn retire(&self, pointer: NonNull<u8>) -> bool {
        instance::with(|arena| arena.ts_pop(pointer.as_ptr())).unwrap_or(false)
    }

    /// Makes the whole Region owning `pointer` read-only. Returns whether the kernel accepted.
    pub fn freeze(&self, pointer: NonNull<u8>) -> bool {
        instance::with(|arena| arena.freeze(pointer.as_ptr())).unwrap_or(false)
    }

    /// Makes the pages covering `len` bytes at `pointer` read-only, clipped to the owning Region.
    pub fn freeze_span(&self, pointer: NonNull<u8>, len: usize) -> bool {
        instance::with(|arena| arena.freeze_span(pointer.as_ptr(), len)).unwrap_or(false)
    }

    /// Allocates `size` bytes at a spot where a same-size allocation previously lived.
    ///
    /// Returns None under the tombstoning policy; laundering and tombstoning are mutually exclusive.
    pub fn launder(&self, size: usize) -> Option<NonNull<u8>> {
        instance::with(|arena| arena.launder(size))
            .filter(|span| span.is_allocation())
            .and_then(|span| NonNull::new(span.ptr))
    }

    /// Returns whether `pointer` lies within memory this allocator owns.
    pub fn within(&self, pointer: NonNull<u8>) -> bool {
        instance::with(|arena| arena.has_provenance(pointer.as_ptr())).unwrap_or(false)
    }

    /// Returns whether a live allocation starts at `pointer`.
    pub fn is_present(&self, pointer: NonNull<u8>) -> bool {
        instance::with(|arena| arena.present(pointer.as_ptr())).unwrap_or(false)
    }

    /// Returns the length of the live allocation starting at `pointer`, block rounding included, or 0.
    pub fn usable_size(&self, pointer: NonNull<u8>) -> usize {
        instance::with(|arena| arena.span_of(pointer.as_ptr()).map(|span| span.len).unwrap_or(0)).unwrap_or(0)
    }

    /// Returns the number of live bytes handed out.
    pub fn musage(&self) -> usize {
        instance::with(|arena| arena.total_usage()).unwrap_or(0)
    }

    /// Returns the number of live bytes handed out for `class`.
    pub fn musage_of(&self, class: SizeClass) -> usize {
        instance::with(|arena| arena.usage_of(class)).unwrap_or(0)
    }

    /// Returns the number of bytes mapped from the kernel.
    pub fn footprint(&self) -> usize {
        instance::with(|arena| arena.total_footprint()).unwrap_or(0)
    }

    /// Returns a copy of the allocation counters.
    pub fn stats(&self) -> Stats {
        instance::with(|arena| arena.stats()).unwrap_or_else(Stats::new)
    }

    /// Unmaps the whole Region owning `pointer`, killing every live allocation within it at once.
    ///
    /// #   Safety
    ///
    /// -   Assumes no allocation within the Region is still in use; nothing checks.
    pub unsafe fn relinquish(&self, pointer: NonNull<u8>) -> bool {
        instance::with(|arena| arena.relinquish(pointer.as_ptr())).unwrap_or(false)
    }
}

unsafe impl GlobalAlloc for FlAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout).map(|ptr| ptr.as_ptr()).unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.deallocate(ptr);
        }
    }
}
