//! The C allocator interface: `malloc`, `free`, `calloc`, `realloc` and
//! `malloc_usable_size` with C linkage, all sharing one
//! [`GenericAllocator`](../allocators/struct.GenericAllocator.html) that
//! grows with the program break.
//!
//! Linking these in (the `gapalloc-malloc` crate builds them as a shared and
//! a static library) replaces the C library's allocator for the whole
//! process, so nothing else moves the break. Freeing or resizing a pointer
//! that is not a live allocation aborts.

use core::ffi::c_void;
use core::ptr::{null_mut, NonNull};

use crate::allocators::{abort_invalid_pointer, GenericAllocator, UnixHeapGrower};
use crate::error::AllocError;

static ALLOCATOR: GenericAllocator<UnixHeapGrower> = GenericAllocator::new();

/// Allocate `size` bytes, aligned to 16. Null when out of memory.
///
/// # Safety
///
/// Nothing else may move the program break below the arena.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    ALLOCATOR.allocate(size) as *mut c_void
}

/// Free an allocation. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live allocation from this module.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let ptr = ptr as *mut u8;
    let result = ALLOCATOR.get_raw().try_free(ptr);
    if result.is_err() {
        abort_invalid_pointer(ptr)
    }
}

/// Allocate `count * size` zeroed bytes. Null if either is zero, the product
/// overflows, or memory is exhausted.
///
/// # Safety
///
/// Nothing else may move the program break below the arena.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    ALLOCATOR.zero_allocate(count, size) as *mut c_void
}

/// Resize an allocation, moving it if it does not fit. A null `ptr`
/// allocates; a zero `size` frees and returns null. On failure `ptr` is left
/// alone and null is returned.
///
/// # Safety
///
/// `ptr` must be null or a live allocation from this module, and must not be
/// used afterwards unless it was returned.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if size == 0 {
        free(ptr);
        return null_mut();
    }
    let old = match NonNull::new(ptr as *mut u8) {
        None => return malloc(size),
        Some(p) => p,
    };

    let result = ALLOCATOR.get_raw().try_resize(old, size);
    match result {
        Ok(p) => p.as_ptr() as *mut c_void,
        Err(AllocError::InvalidFree) => abort_invalid_pointer(old.as_ptr()),
        Err(_) => null_mut(),
    }
}

/// Bytes usable at `ptr`: 0 for null or anything that is not a live
/// allocation.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this module.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    ALLOCATOR.usable_size(ptr as *const u8)
}
