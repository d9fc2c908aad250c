//! Segregated size-class memory engine over anonymous pages.
//!
//! Requests up to 1024 bytes are served from per-class freelists carved out
//! of single 4096-byte anonymous mappings; anything larger gets its own
//! page-rounded mapping with one extra header page. The engine never talks
//! to another allocator: every byte it hands out comes straight from
//! `mmap(2)`, which is what lets the profiler and the exported C surface
//! allocate through it without re-entering themselves.
//!
//! Address-based classification relies on two layout facts: a small block
//! never sits on a page boundary (its page's first word holds the size
//! class), while a large region's user pointer always does (its header word
//! sits one page below).

use core::ptr;

use crate::lock::Mutex;

pub const PAGE_LEN: usize = 4096;

const CLASS_COUNT: usize = 8;
const MAX_SMALL: usize = 1024;
const MIN_BLOCK: usize = 16;

static MEM: Mutex<Mem> = Mutex::new(Mem {
    heads: [ptr::null_mut(); CLASS_COUNT],
});

struct Mem {
    /// Freelist head per size class; null until the class maps its first page.
    heads: [*mut u8; CLASS_COUNT],
}

// Safety: the freelist pointers only reference pages owned by the engine and
// are touched exclusively through the enclosing mutex.
unsafe impl Send for Mem {}

/// Allocate `len` bytes; null when the kernel refuses the mapping.
pub fn alloc(len: usize) -> *mut u8 {
    MEM.lock().alloc(len)
}

/// Allocate and zero `n * len` bytes; null on overflow or mapping failure.
pub fn calloc(n: usize, len: usize) -> *mut u8 {
    let Some(total) = n.checked_mul(len) else {
        return ptr::null_mut();
    };

    let ptr = alloc(total);
    if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Move `ptr` to a block of `len` bytes. Always allocates fresh storage,
/// copies `min(len, usable_size(ptr))` bytes and releases the old block; the
/// old block is kept intact when the new mapping fails.
pub fn realloc(ptr: *mut u8, len: usize) -> *mut u8 {
    MEM.lock().realloc(ptr, len)
}

/// Return `ptr` to its freelist (small) or to the kernel (large).
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    MEM.lock().free(ptr);
}

/// Bytes actually reserved for `ptr`: its class block size, or the region
/// length minus the header page.
pub fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    MEM.lock().usable_size(ptr)
}

impl Mem {
    fn alloc(&mut self, len: usize) -> *mut u8 {
        match class_of_len(len) {
            Some(class) => self.class_alloc(class),
            None => region_alloc(len),
        }
    }

    fn free(&mut self, ptr: *mut u8) {
        match class_of_ptr(ptr) {
            Some(class) => unsafe {
                write_word(ptr, self.heads[class] as u64);
                self.heads[class] = ptr;
            },
            None => region_free(ptr),
        }
    }

    fn realloc(&mut self, ptr: *mut u8, len: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(len);
        }

        let fresh = self.alloc(len);
        if fresh.is_null() {
            return ptr::null_mut();
        }

        let copy = len.min(self.usable_size(ptr));
        unsafe { ptr::copy_nonoverlapping(ptr, fresh, copy) };
        self.free(ptr);
        fresh
    }

    fn usable_size(&self, ptr: *mut u8) -> usize {
        match class_of_ptr(ptr) {
            Some(class) => class_len(class),
            None => region_usable_size(ptr),
        }
    }

    /// Pop a block off the class freelist, carving a fresh page when the
    /// list is empty.
    fn class_alloc(&mut self, class: usize) -> *mut u8 {
        let len = class_len(class);

        if self.heads[class].is_null() {
            let page = page_map(PAGE_LEN);
            if page.is_null() {
                return ptr::null_mut();
            }

            unsafe {
                write_word(page, class as u64);

                // Thread the freelist through the fresh blocks. The final
                // block at page + 4096 - len keeps the zero word the kernel
                // gave us, terminating the list.
                let mut block = page.add(len);
                let last = page.add(PAGE_LEN - len);
                while block < last {
                    write_word(block, block.add(len) as u64);
                    block = block.add(len);
                }

                self.heads[class] = page.add(len);
            }
        }

        let ptr = self.heads[class];
        self.heads[class] = unsafe { read_word(ptr) } as *mut u8;
        ptr
    }
}

/// Size class for a request, or `None` for the large-region path.
fn class_of_len(len: usize) -> Option<usize> {
    if len > MAX_SMALL {
        return None;
    }
    let len = len.max(MIN_BLOCK);
    Some((usize::BITS - (len - 1).leading_zeros()) as usize - 4)
}

fn class_len(class: usize) -> usize {
    MIN_BLOCK << class
}

/// Recover the size class from a bare user pointer, or `None` for a
/// large-region pointer. Small blocks never sit on a page boundary, so a
/// page-aligned pointer must be a region; otherwise the first word of the
/// enclosing page names the class.
fn class_of_ptr(ptr: *mut u8) -> Option<usize> {
    let page = ((ptr as usize) & !(PAGE_LEN - 1)) as *mut u8;
    if page == ptr {
        return None;
    }

    let class = unsafe { read_word(page) } as usize;
    assert!(class < CLASS_COUNT, "corrupt page header for {ptr:p}");
    Some(class)
}

fn region_alloc(len: usize) -> *mut u8 {
    let Some(region_len) = round_up_page(len).and_then(|l| l.checked_add(PAGE_LEN)) else {
        return ptr::null_mut();
    };

    let region = page_map(region_len);
    if region.is_null() {
        return ptr::null_mut();
    }

    unsafe {
        write_word(region, region_len as u64);
        region.add(PAGE_LEN)
    }
}

fn region_free(ptr: *mut u8) {
    unsafe {
        let region = ptr.sub(PAGE_LEN);
        let region_len = read_word(region) as usize;
        libc::munmap(region.cast(), region_len);
    }
}

fn region_usable_size(ptr: *mut u8) -> usize {
    unsafe { read_word(ptr.sub(PAGE_LEN)) as usize - PAGE_LEN }
}

fn round_up_page(len: usize) -> Option<usize> {
    len.checked_add(PAGE_LEN - 1).map(|l| l & !(PAGE_LEN - 1))
}

fn page_map(len: usize) -> *mut u8 {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr.cast()
    }
}

unsafe fn read_word(ptr: *mut u8) -> u64 {
    unsafe { (ptr as *const u64).read() }
}

unsafe fn write_word(ptr: *mut u8, value: u64) {
    unsafe { (ptr as *mut u64).write(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn class_for_small_lengths() {
        assert_eq!(class_of_len(0), Some(0));
        assert_eq!(class_of_len(1), Some(0));
        assert_eq!(class_of_len(8), Some(0));
        assert_eq!(class_of_len(16), Some(0));
        assert_eq!(class_of_len(17), Some(1));
        assert_eq!(class_of_len(32), Some(1));
        assert_eq!(class_of_len(511), Some(5));
        assert_eq!(class_of_len(512), Some(5));
        assert_eq!(class_of_len(513), Some(6));
        assert_eq!(class_of_len(1024), Some(6));
        assert_eq!(class_of_len(1025), None);
    }

    #[test]
    #[serial]
    fn class_lengths_are_powers_of_two() {
        let lens: Vec<usize> = (0..7).map(class_len).collect();
        assert_eq!(lens, [16, 32, 64, 128, 256, 512, 1024]);
    }

    #[test]
    #[serial]
    fn small_alloc_layout() {
        let ptr = alloc(24);
        assert!(!ptr.is_null());
        assert_ne!(ptr as usize % PAGE_LEN, 0);
        assert_eq!(usable_size(ptr), 32);

        let page = ((ptr as usize) & !(PAGE_LEN - 1)) as *mut u8;
        assert_eq!(unsafe { read_word(page) }, 1);

        free(ptr);
    }

    #[test]
    #[serial]
    fn large_alloc_layout() {
        let ptr = alloc(1025);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % PAGE_LEN, 0);
        assert_eq!(usable_size(ptr), PAGE_LEN);

        let big = alloc(100_000);
        assert!(!big.is_null());
        assert!(usable_size(big) >= 100_000);
        assert_eq!(usable_size(big) % PAGE_LEN, 0);

        free(ptr);
        free(big);
    }

    #[test]
    #[serial]
    fn freelist_pops_most_recent_free() {
        let first = alloc(64);
        let second = alloc(64);
        free(first);
        free(second);

        assert_eq!(alloc(64), second);
        assert_eq!(alloc(64), first);

        free(first);
        free(second);
    }

    #[test]
    #[serial]
    fn small_blocks_are_distinct() {
        let ptrs: Vec<*mut u8> = (0..255).map(|_| alloc(16)).collect();
        let mut addrs: Vec<usize> = ptrs.iter().map(|&p| p as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 255);

        for &ptr in &ptrs {
            free(ptr);
        }
    }

    #[test]
    #[serial]
    fn realloc_preserves_prefix() {
        let ptr = alloc(16);
        for offset in 0..16 {
            unsafe { ptr.add(offset).write(offset as u8) };
        }

        let grown = realloc(ptr, 2000);
        assert!(!grown.is_null());
        assert!(usable_size(grown) >= 2000);
        for offset in 0..16 {
            assert_eq!(unsafe { grown.add(offset).read() }, offset as u8);
        }

        let shrunk = realloc(grown, 8);
        assert!(!shrunk.is_null());
        assert_eq!(usable_size(shrunk), 16);
        for offset in 0..8 {
            assert_eq!(unsafe { shrunk.add(offset).read() }, offset as u8);
        }

        free(shrunk);
    }

    #[test]
    #[serial]
    fn calloc_zeroes_and_checks_overflow() {
        let ptr = calloc(3, 100);
        assert!(!ptr.is_null());
        for offset in 0..300 {
            assert_eq!(unsafe { ptr.add(offset).read() }, 0);
        }
        free(ptr);

        assert!(calloc(usize::MAX, 2).is_null());
    }

    #[test]
    #[serial]
    fn free_null_is_noop() {
        free(ptr::null_mut());
        assert_eq!(usable_size(ptr::null_mut()), 0);
    }
}
