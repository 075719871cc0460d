//! Execution substrate for a small preemptive kernel: scheduler, blocking
//! message/wait-queue and semaphore, virtual-memory manager, and VFS vnode
//! cache/locking layer.
//!
//! This crate is `no_std` + `alloc` and exposes no entry point. An embedder
//! (architecture bring-up, boot sequencing, drivers) implements the traits in
//! [`platform`] and calls [`init`] once those are ready; everything else is
//! reached through the module APIs below. Built `#[cfg(test)]`-able via
//! `#![cfg_attr(not(test), no_std)]` so the core algorithms run under `cargo
//! test` on the host against mock `Platform` implementations.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod errno;
pub mod platform;

pub mod sync;

pub mod mm;
pub mod timeout;

pub mod sched;
pub mod msgqueue;
pub mod futex;

pub mod vfs;
pub mod syscall;

pub use errno::{Errno, KResult};
pub use platform::Platform;

use core::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Bring the core up: install the embedder's [`Platform`], size the page
/// allocator from the supplied physical memory regions, initialize the
/// kernel heap, create the per-CPU idle threads, and reserve tid 1 for the
/// init process per the boot sequence described by the specification.
///
/// Must be called exactly once, after the embedder's own MMU/interrupt
/// bring-up and before any other API in this crate is used.
pub fn init(platform: Platform, regions: &[mm::page_alloc::PhysRegion]) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        log::warn!("elk_core::init called more than once, ignoring");
        return;
    }
    platform::install(platform);
    mm::page_alloc::init(regions);
    mm::heap::init();
    sched::init();
    syscall::init();
    log::info!("elk_core initialized");
}

/// True once [`init`] has completed.
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Shared mock [`Platform`] used by every module's `#[cfg(test)]` block, so
/// each one doesn't have to hand-roll its own `Spl`/`TimerSource` stand-ins.
#[cfg(test)]
pub(crate) mod testutil {
    use crate::platform::{self, ContextSwitch, IrqState, Mmu, Platform, Spl, TimerSource};
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct MockSpl;
    impl Spl for MockSpl {
        fn cpu_id(&self) -> usize { 0 }
        fn cpu_count(&self) -> usize { 1 }
        fn save_and_disable(&self) -> IrqState { IrqState(0) }
        fn restore(&self, _: IrqState) {}
        fn halt(&self) {}
        fn send_ipi(&self, _cpu: usize) {}
    }

    struct MockMmu;
    impl Mmu for MockMmu {
        fn map(&self, _pd: u64, _va: u64, _pa: u64, _len: usize, _w: bool, _x: bool) -> crate::KResult<()> { Ok(()) }
        fn unmap(&self, _pd: u64, _va: u64, _len: usize) -> crate::KResult<()> { Ok(()) }
        fn protect(&self, _pd: u64, _va: u64, _len: usize, _w: bool, _x: bool) -> crate::KResult<()> { Ok(()) }
        fn translate(&self, _pd: u64, va: u64) -> Option<u64> { Some(va) }
        fn new_map(&self) -> crate::KResult<u64> { Ok(1) }
        fn destroy_map(&self, _pd: u64) {}
        fn switch(&self, _pd: u64) {}
        fn copy_phys(&self, _src: u64, _dst: u64, _len: usize) -> crate::KResult<()> { Ok(()) }
    }

    struct MockTimer {
        now: AtomicU64,
    }
    impl TimerSource for MockTimer {
        fn monotonic_ns(&self) -> u64 { self.now.load(Ordering::SeqCst) }
        fn realtime_ns(&self) -> u64 { self.now.load(Ordering::SeqCst) }
        fn set_realtime_ns(&self, ns: u64) { self.now.store(ns, Ordering::SeqCst); }
        fn arm(&self, _deadline_ns: u64) {}
    }

    /// A host test has no real second stack to jump to, so this fakes the
    /// "returns twice" contract of a real context switch by simply writing
    /// the new stack-pointer value into the save slot and returning — good
    /// enough to exercise the scheduler's bookkeeping (run queues, state
    /// transitions, wake order) without claiming to model real execution
    /// transfer, which is the embedder's arch-specific job.
    struct MockContextSwitch;
    impl ContextSwitch for MockContextSwitch {
        unsafe fn switch(&self, save_sp: *mut u64, load_sp: u64) {
            *save_sp = load_sp;
        }
        unsafe fn enter(&self, _sp: u64) -> ! {
            loop {
                core::hint::spin_loop();
            }
        }
    }

    static READY: AtomicBool = AtomicBool::new(false);

    /// Install a mock platform exactly once per test binary.
    pub(crate) fn ensure_platform() {
        if !READY.swap(true, Ordering::SeqCst) {
            platform::install(Platform {
                spl: Box::new(MockSpl),
                mmu: Some(Box::new(MockMmu)),
                timer: Box::new(MockTimer { now: AtomicU64::new(1) }),
                ctx_switch: Box::new(MockContextSwitch),
            });
        }
    }
}
