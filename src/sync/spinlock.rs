//! IRQ-safe spinlock.
//!
//! Generalized from the teacher's `sync::spinlock::Spinlock`: same
//! AtomicBool-plus-owner-cpu design and exponential backoff, but interrupt
//! masking goes through [`crate::platform::Spl`] instead of calling
//! `crate::arch::hal` directly, so the lock works identically on the host
//! under `#[cfg(test)]` with a mock `Spl`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::platform::{self, IrqState};

const SPIN_BACKOFF_LIMIT: u32 = 1024;

/// A mutual-exclusion lock that disables interrupts on the owning CPU for
/// its duration, so it is safe to take from both thread and interrupt
/// context (never from a context that could be re-entered by the same CPU).
pub struct Spinlock<T: ?Sized> {
    locked: AtomicBool,
    owner_cpu: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

const NO_OWNER: usize = usize::MAX;

impl<T> Spinlock<T> {
    /// Create a new unlocked spinlock wrapping `data`.
    pub const fn new(data: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicUsize::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquire the lock, spinning (with exponential backoff) until it is
    /// free. Interrupts are disabled for the lifetime of the returned guard.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let irq = platform::with_spl(|spl| spl.save_and_disable());
        let mut backoff: u32 = 1;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            for _ in 0..backoff {
                core::hint::spin_loop();
            }
            backoff = (backoff * 2).min(SPIN_BACKOFF_LIMIT);
        }
        let cpu = platform::with_spl(|spl| spl.cpu_id());
        self.owner_cpu.store(cpu, Ordering::Relaxed);
        SpinlockGuard { lock: self, irq: Some(irq) }
    }

    /// Try to acquire the lock without spinning. On failure, interrupt state
    /// is left untouched.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let irq = platform::with_spl(|spl| spl.save_and_disable());
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let cpu = platform::with_spl(|spl| spl.cpu_id());
            self.owner_cpu.store(cpu, Ordering::Relaxed);
            Some(SpinlockGuard { lock: self, irq: Some(irq) })
        } else {
            platform::with_spl(|spl| spl.restore(irq));
            None
        }
    }

    /// Force-unlock without going through a guard. Only for fault-handler
    /// recovery paths that know the guard was lost (e.g. the owning thread
    /// was torn down); does not restore interrupt state.
    ///
    /// # Safety
    /// Caller must guarantee no other context believes it still holds the
    /// lock.
    pub unsafe fn force_unlock(&self) {
        self.owner_cpu.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard for a locked [`Spinlock`].
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    irq: Option<IrqState>,
}

impl<'a, T: ?Sized> SpinlockGuard<'a, T> {
    /// Release the lock bit but keep interrupts disabled — used by the
    /// scheduler when a context switch must happen with IF=0 across the
    /// switch, restoring interrupts only once the new thread resumes.
    pub fn release_no_irq_restore(self) {
        self.lock.owner_cpu.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<'a, T: ?Sized> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.owner_cpu.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        if let Some(irq) = self.irq.take() {
            platform::with_spl(|spl| spl.restore(irq));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;

    #[test]
    fn lock_excludes_and_unlocks() {
        ensure_platform();
        let lock = Spinlock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        ensure_platform();
        let lock = Spinlock::new(0u32);
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
