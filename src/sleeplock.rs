//! Sleep locks protect block contents across disk I/O.
//!
//! Holding a spinlock for the length of a disk transfer would waste CPU
//! spinning on every other waiter's behalf. A sleep lock instead parks its
//! waiters (here, blocking the OS thread via a condition variable) and lets
//! the holder itself block on I/O while still holding it. Because waiting
//! on a sleep lock can block the executor, a sleep lock must never be
//! acquired while a spinlock is held — acquisition in this crate always
//! happens after the relevant bucket/pool spinlock has already been
//! released.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

pub struct SleepLock<T> {
    name: &'static str,
    locked: Mutex<bool>,
    condvar: Condvar,
    data: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            name,
            locked: Mutex::new(false),
            condvar: Condvar::new(),
            data: std::cell::UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.condvar.wait(locked).unwrap();
        }
        *locked = true;
        drop(locked);

        SleepLockGuard { lock: self }
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap();
        *locked = false;
        drop(locked);
        self.condvar.notify_one();
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn serializes_holders() {
        let lock = Arc::new(SleepLock::new(0usize, "test"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let mut guard = lock.lock();
                    let seen = *guard;
                    thread::sleep(Duration::from_micros(1));
                    *guard = seen + 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 800);
    }
}
