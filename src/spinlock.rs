//! Spinlocks protect the cache's metadata: bucket lists and the pool-wide
//! eviction lock.
//!
//! A spinlock's acquisition never blocks the executor — a waiter busy-loops
//! until the lock is free. The holder must therefore never perform an
//! operation that can sleep (no disk I/O, no content-lock acquisition) while
//! holding one, exactly the discipline the sleep lock in `sleeplock` is for.
//!
//! Design in Rust: rather than a bare `lock` field as in a C kernel, the
//! lock is a smart pointer wrapping its data (`SpinLock<T>`). A guard is
//! handed back on `lock()`, and any access to the protected data has to go
//! through it, so the compiler rules out touching the data without holding
//! the lock. `Drop` on the guard releases the lock automatically.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    // 0 means "unheld"; thread tags are assigned starting at 1.
    holder: AtomicU64,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: `SpinLock<T>` only ever hands out `&mut T` to the single thread
// that successfully transitions `locked` from false to true, so sharing it
// across threads is sound as long as `T` itself is safe to send between
// threads.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicU64::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            inner: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn acquire(&self) {
        let tag = current_thread_tag();
        if self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == tag {
            panic!("spinlock \"{}\": reacquired by its own holder", self.name);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        self.holder.store(tag, Ordering::Relaxed);
    }

    fn release(&self) {
        let tag = current_thread_tag();
        if self.holder.load(Ordering::Relaxed) != tag {
            panic!("spinlock \"{}\": released by a thread not holding it", self.name);
        }
        self.holder.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    inner: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.release();
    }
}
