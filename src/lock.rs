//! Futex-backed mutex.
//!
//! Every public entry point of the allocator serializes on one of these, so
//! the primitive has to work without any heap allocation and without lazy
//! initialisation: a single atomic word, contended waits parked in the
//! kernel via `futex(2)`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Mutual exclusion over `T`, lockable from a `const` static.
pub struct Mutex<T> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

// Safety: the lock protocol hands out at most one guard at a time, so the
// inner value moves between threads only behind exclusive access.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex {
            state: AtomicU32::new(UNLOCKED),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, parking in the kernel while it is contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        while self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            futex_wait(&self.state, LOCKED);
        }
        MutexGuard { lock: self }
    }

    /// Single compare-and-exchange attempt; never waits.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { lock: self })
    }

    fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
        futex_wake(&self.state);
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Sleep until the word at `state` no longer holds `expected`.
fn futex_wait(state: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

/// Wake one waiter parked on `state`.
fn futex_wake(state: &AtomicU32) {
    unsafe {
        libc::syscall(libc::SYS_futex, state.as_ptr(), libc::FUTEX_WAKE, 1);
    }
}
