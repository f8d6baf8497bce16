//! Lock primitives used by [`MemoryPool`](crate::pool::MemoryPool)
//!
//! The pool takes its mutual-exclusion strategy as a type parameter. Two
//! implementations are provided:
//!
//! - [`SpinLock`]: a test-and-test-and-set spin lock with yield backoff, the
//!   default for shared pools
//! - [`NullLock`]: a no-op lock for pools confined to a single thread
//!
//! Blocking is spin-based, never syscall-based. There are no cancellation
//! semantics; [`RawLock::try_lock_for`] gives callers a bounded wait.

use core::sync::atomic::{AtomicBool, Ordering};
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use crate::utils::Backoff;

/// Minimal mutual-exclusion contract.
///
/// # Safety
///
/// Implementations that are `Sync` must provide real mutual exclusion:
/// between a successful `lock` (or `try_lock`/`try_lock_for` returning
/// `true`) and the matching `unlock`, no other thread may win the lock.
/// The pool relies on this to guard its intrusive lists and block headers.
///
/// A `!Sync` implementation (such as [`NullLock`]) may be a no-op, since the
/// type system already prevents the protected state from being shared.
pub unsafe trait RawLock: Default {
    /// Acquires the lock, spinning until it is available.
    fn lock(&self);

    /// Releases the lock.
    ///
    /// Must only be called by the owner of a held lock.
    fn unlock(&self);

    /// Attempts to acquire the lock without spinning.
    fn try_lock(&self) -> bool;

    /// Attempts to acquire the lock, giving up after `timeout`.
    fn try_lock_for(&self, timeout: Duration) -> bool;
}

/// Test-and-test-and-set spin lock with yield backoff.
///
/// The uncontended path is a single `exchange`. Under contention, waiters
/// poll with relaxed loads (no cache-line ping-pong) and back off
/// exponentially before yielding the thread.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates a new, unlocked spin lock.
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false) }
    }

    /// Returns whether the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

// SAFETY: SpinLock provides mutual exclusion.
// - lock() returns only after exchange(true) observed false (Acquire)
// - unlock() stores false with Release, publishing the critical section
// - try_lock()/try_lock_for() acquire through the same exchange
unsafe impl RawLock for SpinLock {
    fn lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            // Optimistically assume the lock is free on the first try
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            // Wait for release without generating cache misses
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin_or_yield();
            }
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn try_lock(&self) -> bool {
        // Relaxed pre-check keeps while(!try_lock()) callers off the bus
        !self.locked.load(Ordering::Relaxed) && !self.locked.swap(true, Ordering::Acquire)
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return true;
            }
            while self.locked.load(Ordering::Relaxed) {
                if Instant::now() > deadline {
                    return false;
                }
                backoff.spin_or_yield();
            }
        }
    }
}

/// No-op lock for single-threaded pools.
///
/// `NullLock` is deliberately `!Sync`: a pool parameterized with it cannot be
/// shared across threads through safe code, which is exactly the situation
/// where skipping synchronization is sound.
#[derive(Debug, Default)]
pub struct NullLock {
    // *mut () keeps the type !Sync without changing its size
    _not_sync: PhantomData<*mut ()>,
}

impl NullLock {
    /// Creates a new null lock.
    pub const fn new() -> Self {
        Self { _not_sync: PhantomData }
    }
}

// SAFETY: NullLock is !Sync, so the protected state is never reachable from
// two threads at once; moving the lock (and its pool) between threads is fine.
unsafe impl Send for NullLock {}

// SAFETY: NullLock is !Sync; the mutual-exclusion obligation of RawLock only
// binds Sync implementations.
unsafe impl RawLock for NullLock {
    #[inline(always)]
    fn lock(&self) {}

    #[inline(always)]
    fn unlock(&self) {}

    #[inline(always)]
    fn try_lock(&self) -> bool {
        true
    }

    #[inline(always)]
    fn try_lock_for(&self, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_lock_unlock() {
        let lock = SpinLock::new();
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn try_lock_for_times_out() {
        let lock = SpinLock::new();
        lock.lock();
        assert!(!lock.try_lock_for(Duration::from_millis(10)));
        lock.unlock();
        assert!(lock.try_lock_for(Duration::from_millis(10)));
        lock.unlock();
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        const THREADS: usize = 4;
        const ITERS: usize = 10_000;

        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::cell::UnsafeCell::new(0usize));

        struct Shared(Arc<std::cell::UnsafeCell<usize>>);
        // SAFETY: all access to the cell happens under `lock` below.
        unsafe impl Send for Shared {}

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let lock = Arc::clone(&lock);
            let shared = Shared(Arc::clone(&counter));
            handles.push(thread::spawn(move || {
                // Force the whole `Shared` to be captured (not just the inner
                // `Arc<UnsafeCell<_>>`) so the closure stays `Send`.
                let shared = shared;
                for _ in 0..ITERS {
                    lock.lock();
                    // SAFETY: guarded by `lock`.
                    unsafe { *shared.0.get() += 1 };
                    lock.unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // SAFETY: all writers joined.
        assert_eq!(unsafe { *counter.get() }, THREADS * ITERS);
    }

    #[test]
    fn null_lock_is_callable() {
        let lock = NullLock::new();
        lock.lock();
        assert!(lock.try_lock());
        assert!(lock.try_lock_for(Duration::from_millis(1)));
        lock.unlock();
    }
}
