//! Exported C allocation surface.
//!
//! These symbols satisfy the libc dynamic-memory contract, so preloading
//! the library (or linking it into a binary) replaces the process allocator
//! wholesale. Every entry point serializes on one global mutex and drives
//! the engine and the profiler in a fixed order; the one exception is a
//! call made while the calling thread is already inside the profiler, which
//! is allocator-internal by definition and goes straight to the engine —
//! taking the global mutex again on the same thread would deadlock it.
//!
//! A failed engine allocation never touches the profiler. Integrity
//! violations (double free, index corruption) panic, and a panic crossing
//! these `extern "C"` boundaries aborts the process.

use core::ffi::{c_int, c_void};

use crate::lock::Mutex;
use crate::mem::{self, PAGE_LEN};
use crate::prof;

static GLOBAL: Mutex<()> = Mutex::new(());

#[unsafe(no_mangle)]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    if prof::reentrant() {
        return mem::alloc(size).cast();
    }

    let _global = GLOBAL.lock();
    let ptr = mem::alloc(size);
    if !ptr.is_null() {
        prof::record_alloc(ptr, size);
    }
    ptr.cast()
}

#[unsafe(no_mangle)]
pub extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    if prof::reentrant() {
        return mem::calloc(nmemb, size).cast();
    }

    let _global = GLOBAL.lock();
    let ptr = mem::calloc(nmemb, size);
    if !ptr.is_null() {
        prof::record_alloc(ptr, nmemb * size);
    }
    ptr.cast()
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this allocator
/// and not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let ptr = ptr.cast::<u8>();

    if prof::reentrant() {
        return mem::realloc(ptr, size).cast();
    }

    let _global = GLOBAL.lock();

    if ptr.is_null() {
        let fresh = mem::alloc(size);
        if !fresh.is_null() {
            prof::record_alloc(fresh, size);
        }
        return fresh.cast();
    }

    // The old block's usable size must be read while the block still
    // exists; a successful engine realloc unmaps it. The live index is only
    // touched once the move is known to have succeeded, so a failed realloc
    // leaves the caller's still-valid block tracked and freeable.
    let usable = mem::usable_size(ptr) as u64;
    let fresh = mem::realloc(ptr, size);
    if fresh.is_null() {
        return core::ptr::null_mut();
    }

    prof::record_free_sized(ptr, usable);
    prof::record_alloc(fresh, size);
    fresh.cast()
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this allocator
/// and not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let ptr = ptr.cast::<u8>();

    if prof::reentrant() {
        mem::free(ptr);
        return;
    }

    let _global = GLOBAL.lock();
    prof::record_free(ptr);
    mem::free(ptr);
}

/// # Safety
///
/// `memptr` must be valid for writing one pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }

    let ptr = malloc(round_up(size, alignment));
    if ptr.is_null() {
        return libc::ENOMEM;
    }

    unsafe { *memptr = ptr };
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    malloc(round_up(size, alignment))
}

#[unsafe(no_mangle)]
pub extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    malloc(round_up(size, alignment))
}

#[unsafe(no_mangle)]
pub extern "C" fn valloc(size: usize) -> *mut c_void {
    malloc(round_up(size.max(1), PAGE_LEN))
}

#[unsafe(no_mangle)]
pub extern "C" fn pvalloc(size: usize) -> *mut c_void {
    malloc(round_up(size.max(1), PAGE_LEN))
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this allocator
/// and not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let ptr = ptr.cast::<u8>();

    if prof::reentrant() {
        return mem::usable_size(ptr);
    }

    let _global = GLOBAL.lock();
    mem::usable_size(ptr)
}

/// Round `size` up to a multiple of `alignment` (a power of two). Saturates
/// so an absurd request flows through as an allocation failure.
fn round_up(size: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return size;
    }
    match size.checked_add(alignment - 1) {
        Some(padded) => padded & !(alignment - 1),
        None => usize::MAX,
    }
}
