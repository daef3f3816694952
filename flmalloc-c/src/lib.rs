#![no_std]
#![deny(missing_docs)]

//! Exposition of the FlAllocator API via a C ABI.

use core::alloc::Layout;
use core::ptr::{self, NonNull};

use flmalloc::FlAllocator;

/// Prepares the calling thread's Arena for allocation.
///
/// Returns 0 on success, and a negative value otherwise.
///
/// Failure may occur if the kernel cannot map the Arena's metadata, or its eagerly provisioned chains.
#[cold]
#[no_mangle]
pub extern "C" fn fl_warm_up() -> i32 { if ALLOCATOR.warm_up().is_ok() { 0 } else { -1 } }

/// Allocates `size` bytes of memory, generally suitably aligned.
///
/// If the allocation fails, the returned pointer may be NULL.
///
/// If the allocation succeeds, the pointer is aligned on the greatest power of 2 which divides `size`, capped at one
/// page; this guarantees that the pointer is suitably aligned:
///
/// -   The alignment of the type for which memory is allocated must be a power of 2.
/// -   The size of the type for which memory is allocated must be a multiple of its alignment.
/// -   Therefore, the greatest power of 2 which divides `size` is greater than the required alignment.
#[no_mangle]
pub extern "C" fn fl_malloc(size: usize) -> *mut u8 {
    let alignment = natural_alignment(size);

    //  Safety:
    //  -   `alignment` is a non-zero power of 2, no larger than a page.
    let layout = unsafe { Layout::from_size_align_unchecked(size, alignment) };

    ALLOCATOR.allocate(layout).map(NonNull::as_ptr).unwrap_or(ptr::null_mut())
}

/// Allocates a zero-initialized array of `count` elements of `size` bytes each.
///
/// Returns NULL if the total size overflows, or the allocation fails.
#[no_mangle]
pub extern "C" fn fl_calloc(count: usize, size: usize) -> *mut u8 {
    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => return ptr::null_mut(),
    };

    let pointer = fl_malloc(total);

    if !pointer.is_null() {
        //  Safety:
        //  -   `pointer` was just allocated with at least `total` writable bytes.
        unsafe { ptr::write_bytes(pointer, 0, total) };
    }

    pointer
}

/// Resizes the allocation at `pointer` to `size` bytes, moving it if need be.
///
/// A NULL `pointer` allocates; a zero `size` frees and returns NULL. On failure the original allocation is left
/// untouched, and NULL is returned.
///
/// #   Safety
///
/// -   Assumes `pointer` is NULL, or was returned by a prior allocation and not freed since.
#[no_mangle]
pub unsafe extern "C" fn fl_realloc(pointer: *mut u8, size: usize) -> *mut u8 {
    let old = match NonNull::new(pointer) {
        Some(old) => old,
        None => return fl_malloc(size),
    };

    if size == 0 {
        ALLOCATOR.deallocate(old);
        return ptr::null_mut();
    }

    let old_size = ALLOCATOR.usable_size(old);

    let new = fl_malloc(size);

    if new.is_null() {
        return ptr::null_mut();
    }

    //  Safety:
    //  -   `old` holds at least `old_size` readable bytes, `new` at least `size` writable ones, and the two
    //      allocations do not overlap.
    ptr::copy_nonoverlapping(old.as_ptr(), new, core::cmp::min(old_size, size));

    ALLOCATOR.deallocate(old);

    new
}

/// Allocates `size` bytes of memory, aligned on an `alignment` boundary.
///
/// Returns NULL if `alignment` is not a power of 2, or exceeds one page, or the allocation fails.
#[no_mangle]
pub extern "C" fn fl_aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    if alignment == 0 || alignment.count_ones() != 1 {
        return ptr::null_mut();
    }

    match Layout::from_size_align(size, alignment) {
        Ok(layout) => ALLOCATOR.allocate(layout).map(NonNull::as_ptr).unwrap_or(ptr::null_mut()),
        Err(_) => ptr::null_mut(),
    }
}

/// Deallocates the memory located at `pointer`; a NULL `pointer` is a no-op.
///
/// #   Safety
///
/// -   Assumes `pointer` has been returned by a prior allocation.
/// -   Assumes `pointer` has not been deallocated since its allocation.
/// -   Assumes the memory pointed by `pointer` is no longer in use.
#[no_mangle]
pub unsafe extern "C" fn fl_free(pointer: *mut u8) {
    if let Some(pointer) = NonNull::new(pointer) {
        ALLOCATOR.deallocate(pointer);
    }
}

/// Deallocates the memory located at `pointer`, whose allocation was at least `size` bytes.
///
/// #   Safety
///
/// -   Assumes everything `fl_free` assumes.
/// -   Assumes `size` does not exceed the length of the allocation.
#[no_mangle]
pub unsafe extern "C" fn fl_dealloc_sized(pointer: *mut u8, size: usize) {
    if let Some(pointer) = NonNull::new(pointer) {
        debug_assert!(size <= ALLOCATOR.usable_size(pointer));

        ALLOCATOR.deallocate(pointer);
    }
}

/// Deallocates the memory located at `pointer` by tombstoning it, whatever the deletion policy.
///
/// Returns 1 if a live allocation was retired, 0 otherwise.
///
/// #   Safety
///
/// -   Assumes the memory pointed by `pointer` is no longer in use.
#[no_mangle]
pub unsafe extern "C" fn fl_retire(pointer: *mut u8) -> i32 {
    match NonNull::new(pointer) {
        Some(pointer) => ALLOCATOR.retire(pointer) as i32,
        None => 0,
    }
}

/// Makes the whole Region owning `pointer` read-only.
///
/// Returns 1 if the kernel accepted, 0 otherwise.
#[no_mangle]
pub extern "C" fn fl_freeze(pointer: *mut u8) -> i32 {
    match NonNull::new(pointer) {
        Some(pointer) => ALLOCATOR.freeze(pointer) as i32,
        None => 0,
    }
}

/// Makes the pages covering `length` bytes at `pointer` read-only, clipped to the owning Region.
///
/// Returns 1 if the kernel accepted, 0 otherwise.
#[no_mangle]
pub extern "C" fn fl_freeze_span(pointer: *mut u8, length: usize) -> i32 {
    match NonNull::new(pointer) {
        Some(pointer) => ALLOCATOR.freeze_span(pointer, length) as i32,
        None => 0,
    }
}

/// Allocates `size` bytes at a spot where a same-size allocation previously lived.
///
/// Returns NULL under the tombstoning policy; laundering and tombstoning are mutually exclusive.
#[no_mangle]
pub extern "C" fn fl_launder(size: usize) -> *mut u8 {
    ALLOCATOR.launder(size).map(NonNull::as_ptr).unwrap_or(ptr::null_mut())
}

/// Returns 1 if `pointer` lies within memory this allocator owns, 0 otherwise.
#[no_mangle]
pub extern "C" fn fl_within(pointer: *mut u8) -> i32 {
    match NonNull::new(pointer) {
        Some(pointer) => ALLOCATOR.within(pointer) as i32,
        None => 0,
    }
}

/// Returns 1 if a live allocation starts at `pointer`, 0 otherwise.
#[no_mangle]
pub extern "C" fn fl_is_present(pointer: *mut u8) -> i32 {
    match NonNull::new(pointer) {
        Some(pointer) => ALLOCATOR.is_present(pointer) as i32,
        None => 0,
    }
}

/// Returns the number of live bytes handed out.
#[no_mangle]
pub extern "C" fn fl_musage() -> usize { ALLOCATOR.musage() }

/// Returns the number of bytes mapped from the kernel.
#[no_mangle]
pub extern "C" fn fl_footprint() -> usize { ALLOCATOR.footprint() }

/// Unmaps the whole Region owning `pointer`, killing every live allocation within it at once.
///
/// Returns 1 on success, 0 otherwise.
///
/// #   Safety
///
/// -   Assumes no allocation within the Region is still in use; nothing checks.
#[no_mangle]
pub unsafe extern "C" fn fl_relinquish(pointer: *mut u8) -> i32 {
    match NonNull::new(pointer) {
        Some(pointer) => ALLOCATOR.relinquish(pointer) as i32,
        None => 0,
    }
}

//
//  Implementation
//

static ALLOCATOR: FlAllocator = FlAllocator::new();

//  The greatest power of 2 dividing `size`, capped at one page; 1 for a zero `size`.
fn natural_alignment(size: usize) -> usize {
    const PAGE: usize = 4096;

    if size == 0 {
        return 1;
    }

    let alignment = 1usize << size.trailing_zeros().min(63);

    if alignment > PAGE { PAGE } else { alignment }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    extern "C" {
        fn abort() -> !;
    }

    //  Safety:
    //  -   `abort` is provided by the C runtime this library is linked against.
    unsafe { abort() }
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn free_null_is_noop() {
    //  Safety:
    //  -   NULL is explicitly tolerated.
    unsafe { fl_free(ptr::null_mut()) };
}

#[test]
fn realloc_null_allocates() {
    //  Safety:
    //  -   NULL is explicitly tolerated.
    let pointer = unsafe { fl_realloc(ptr::null_mut(), 64) };

    assert!(!pointer.is_null());
    assert_eq!(1, fl_is_present(pointer));

    //  Safety:
    //  -   `pointer` was just allocated, and is not in use.
    unsafe { fl_free(pointer) };
}

#[test]
fn realloc_zero_frees() {
    let pointer = fl_malloc(64);
    assert!(!pointer.is_null());

    //  Safety:
    //  -   `pointer` was just allocated, and is not in use.
    let result = unsafe { fl_realloc(pointer, 0) };

    assert!(result.is_null());
    assert_eq!(0, fl_is_present(pointer));
}

#[test]
fn realloc_preserves_prefix() {
    let pointer = fl_malloc(64);
    assert!(!pointer.is_null());

    //  Safety:
    //  -   `pointer` holds at least 64 writable bytes.
    unsafe { ptr::write_bytes(pointer, 0x5A, 64) };

    //  Safety:
    //  -   `pointer` was just allocated, and is not in use.
    let grown = unsafe { fl_realloc(pointer, 300) };
    assert!(!grown.is_null());

    //  Safety:
    //  -   `grown` holds at least 300 readable bytes.
    let prefix = unsafe { core::slice::from_raw_parts(grown, 64) };
    assert!(prefix.iter().all(|&byte| byte == 0x5A));

    //  Safety:
    //  -   `grown` was just allocated, and is not in use.
    unsafe { fl_free(grown) };
}

#[test]
fn calloc_zeroes_and_guards_overflow() {
    assert!(fl_calloc(usize::MAX, 2).is_null());

    let pointer = fl_calloc(4, 16);
    assert!(!pointer.is_null());

    //  Safety:
    //  -   `pointer` holds at least 64 readable bytes.
    let bytes = unsafe { core::slice::from_raw_parts(pointer, 64) };
    assert!(bytes.iter().all(|&byte| byte == 0));

    //  Safety:
    //  -   `pointer` was just allocated, and is not in use.
    unsafe { fl_free(pointer) };
}

#[test]
fn aligned_alloc_validates_alignment() {
    assert!(fl_aligned_alloc(3, 64).is_null());
    assert!(fl_aligned_alloc(8192, 64).is_null());

    let pointer = fl_aligned_alloc(512, 64);

    assert!(!pointer.is_null());
    assert_eq!(0, pointer as usize % 512);

    //  Safety:
    //  -   `pointer` was just allocated, and is not in use.
    unsafe { fl_free(pointer) };
}

} // mod tests
