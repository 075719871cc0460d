//! Sleeping mutex.
//!
//! The teacher's `sync::mutex::Mutex` is an explicit Phase-1 stub: it spins
//! on a `Spinlock<MutexInner>` and leaves three TODOs ("wait queue of
//! blocked thread ids", "yield to scheduler instead of spinning", "wake
//! first thread in wait queue"). This is that Phase 2: the same API shape,
//! now backed by the scheduler's own FIFO wait-list (`sched::wait`), so a
//! contended `lock()` blocks the calling thread instead of spinning.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::sched;
use crate::sync::spinlock::Spinlock;

struct MutexInner {
    locked: bool,
    waiters: VecDeque<u32>,
}

/// A mutex whose contended path blocks the calling thread via the
/// scheduler rather than spinning.
pub struct Mutex<T: ?Sized> {
    inner: Spinlock<MutexInner>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create a new unlocked mutex wrapping `data`.
    pub const fn new(data: T) -> Self {
        Mutex {
            inner: Spinlock::new(MutexInner { locked: false, waiters: VecDeque::new() }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the mutex, blocking the calling thread if it is held.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut inner = self.inner.lock();
            if !inner.locked {
                inner.locked = true;
                return MutexGuard { mutex: self };
            }
            let me = sched::current_tid();
            inner.waiters.push_back(me);
            drop(inner);
            sched::block_current(sched::ThreadState::MsgWait);
            // Woken by `unlock`; loop around and retry the acquire.
        }
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut inner = self.inner.lock();
        if inner.locked {
            None
        } else {
            inner.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    fn unlock(&self) {
        let mut inner = self.inner.lock();
        inner.locked = false;
        let woken = inner.waiters.pop_front();
        drop(inner);
        if let Some(tid) = woken {
            sched::make_ready(tid);
        }
    }
}

/// RAII guard for a locked [`Mutex`].
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;

    #[test]
    fn uncontended_lock_unlock() {
        ensure_platform();
        let m = Mutex::new(5);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn try_lock_respects_held_state() {
        ensure_platform();
        let m = Mutex::new(0);
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
