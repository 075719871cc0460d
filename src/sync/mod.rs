//! Synchronization primitives.
//!
//! An IRQ-safe [`spinlock::Spinlock`] for short critical sections used by
//! every other subsystem in this crate, a scheduler-integrated
//! [`mutex::Mutex`] for longer held sections, and a [`semaphore::Semaphore`]
//! built on the scheduler's wait-list primitive (§4.6).

pub mod spinlock;
pub mod mutex;
pub mod semaphore;
