//! Seam between this crate and the embedder's architecture/driver code.
//!
//! The teacher kernel reaches per-architecture operations through
//! `arch::hal::*`, a set of free functions `cfg`-gated on `target_arch`.
//! That works for a bootable binary that is compiled once per architecture;
//! a reusable library crate instead needs the embedder to hand in concrete
//! implementations, so the same set of operations is re-expressed here as a
//! small trait bundle installed once via [`install`].

use alloc::boxed::Box;
use spin_placeholder::Once;

use crate::errno::KResult;

mod spin_placeholder {
    //! Tiny `Once`-cell, avoiding a dependency on `spin` or `once_cell` for a
    //! single crate-global write-once slot; guarded the same way the
    //! teacher's `Spinlock<Option<T>>` singletons are.
    use crate::sync::spinlock::Spinlock;

    pub struct Once<T> {
        inner: Spinlock<Option<T>>,
    }

    impl<T> Once<T> {
        pub const fn new() -> Self {
            Once { inner: Spinlock::new(None) }
        }

        pub fn set(&self, value: T) {
            *self.inner.lock() = Some(value);
        }

        pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
            let guard = self.inner.lock();
            f(guard.as_ref().expect("platform not installed"))
        }
    }
}

/// Opaque, previously-saved interrupt state returned by [`Spl::save_and_disable`].
#[derive(Clone, Copy)]
pub struct IrqState(pub u64);

/// Interrupt masking and per-CPU identification ("spl" in the traditional
/// sense: set priority level). Grounded on `arch::hal`'s
/// `{save,restore}_interrupt_state`, `cpu_id`, `halt`.
pub trait Spl: Send + Sync {
    /// Identify the calling CPU (stable across migration).
    fn cpu_id(&self) -> usize;
    /// Number of online CPUs.
    fn cpu_count(&self) -> usize;
    /// Disable interrupts on this CPU, returning the prior state.
    fn save_and_disable(&self) -> IrqState;
    /// Restore a previously saved interrupt state.
    fn restore(&self, state: IrqState);
    /// Put the CPU into a low-power wait-for-interrupt state.
    fn halt(&self);
    /// Send an inter-processor interrupt to wake a CPU that may be halted.
    fn send_ipi(&self, cpu: usize);
}

/// Page-table / address-space operations. Grounded on `arch::hal`'s
/// `current_page_table`/`switch_page_table`/`flush_tlb*` plus the spec's
/// per-segment protection model (§4.3).
pub trait Mmu: Send + Sync {
    /// Map one page-aligned physical range into a page directory with the
    /// given protection (derived from segment flags per §4.3).
    fn map(&self, pd: u64, va: u64, pa: u64, len: usize, writable: bool, exec: bool) -> KResult<()>;
    /// Unmap a page-aligned virtual range.
    fn unmap(&self, pd: u64, va: u64, len: usize) -> KResult<()>;
    /// Change protection on an already-mapped range.
    fn protect(&self, pd: u64, va: u64, len: usize, writable: bool, exec: bool) -> KResult<()>;
    /// Resolve a virtual address to its backing physical address, if mapped.
    fn translate(&self, pd: u64, va: u64) -> Option<u64>;
    /// Allocate a fresh, empty page directory (copy of kernel mappings only).
    fn new_map(&self) -> KResult<u64>;
    /// Tear down a page directory allocated by `new_map`.
    fn destroy_map(&self, pd: u64);
    /// Activate `pd` as the current address space on this CPU.
    fn switch(&self, pd: u64);
    /// Copy `len` bytes from one physical range to another, e.g. via a
    /// temporary mapping of both ranges into kernel space. Used to break
    /// sharing on a writable `attribute` change and to duplicate writable
    /// segments on `dup` (§4.3).
    fn copy_phys(&self, src: u64, dst: u64, len: usize) -> KResult<()>;
}

/// Monotonic/realtime clock plus one-shot deadline arming. Grounded on
/// `arch::hal::timer_current_ticks`/`timer_frequency_hz`, generalized from
/// millisecond PIT ticks to nanosecond deadlines per §6 ("Timer source").
pub trait TimerSource: Send + Sync {
    /// Nanoseconds since an arbitrary but fixed epoch (boot).
    fn monotonic_ns(&self) -> u64;
    /// Nanoseconds since the Unix epoch.
    fn realtime_ns(&self) -> u64;
    /// Adjust the realtime clock (e.g. via `clock_settime`).
    fn set_realtime_ns(&self, ns: u64);
    /// Arm a one-shot interrupt to fire at or after the given absolute
    /// monotonic deadline; a new call replaces any previously armed one.
    fn arm(&self, deadline_ns: u64);
}

/// Architecture context switch primitive (§9 "weakly-typed opaque context
/// pointer"). A thread's saved context is just the value of its stack
/// pointer at the moment it stopped running; the embedder's arch-specific
/// code is responsible for what is actually stored at that address (saved
/// registers, return address, etc.) and for `switch`'s "returns twice"
/// behaviour (once when the outgoing thread saves, once when it is later
/// resumed).
pub trait ContextSwitch: Send + Sync {
    /// Save the current CPU state, write the resulting stack pointer to
    /// `*save_sp`, then load and resume execution at `load_sp`.
    ///
    /// # Safety
    /// `load_sp` must point at a context previously produced by this same
    /// primitive (or by initial-context construction), and `save_sp` must be
    /// valid to write through.
    unsafe fn switch(&self, save_sp: *mut u64, load_sp: u64);

    /// Resume execution at `sp` without saving anything, for the path where
    /// there is no "current" thread to save (entering the very first
    /// thread on a CPU).
    ///
    /// # Safety
    /// `sp` must point at a valid saved context. Never returns.
    unsafe fn enter(&self, sp: u64) -> !;
}

/// Byte-addressable block storage, written to/read from by filesystem
/// personalities outside this crate's core scope; the trait itself is part
/// of the core's external-interface surface (§6, "Driver interface").
pub trait BlockDevice: Send + Sync {
    /// Logical block size in bytes.
    fn block_size(&self) -> usize;
    /// Number of addressable blocks.
    fn block_count(&self) -> u64;
    /// Read `buf.len()` bytes starting at block `lba`.
    fn read(&self, lba: u64, buf: &mut [u8]) -> KResult<()>;
    /// Write `buf` starting at block `lba`.
    fn write(&self, lba: u64, buf: &[u8]) -> KResult<()>;
}

/// Stream character device (console, serial, null/zero).
pub trait CharDevice: Send + Sync {
    /// Read up to `buf.len()` bytes without blocking; returns bytes read.
    fn read(&self, buf: &mut [u8]) -> KResult<usize>;
    /// Write `buf`, returning the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> KResult<usize>;
}

/// Bundle of embedder-supplied collaborators, installed once at boot.
pub struct Platform {
    /// Interrupt masking / CPU identification.
    pub spl: Box<dyn Spl>,
    /// Page-table manipulation, or `None` on a no-MMU build (§4.3 describes
    /// both an MMU and a no-MMU VM backend sharing one interface).
    pub mmu: Option<Box<dyn Mmu>>,
    /// Monotonic/realtime clock and one-shot timer arming.
    pub timer: Box<dyn TimerSource>,
    /// Architecture context switch.
    pub ctx_switch: Box<dyn ContextSwitch>,
}

static PLATFORM: Once<Platform> = Once::new();

/// Install the embedder's platform. Called once by [`crate::init`].
pub(crate) fn install(platform: Platform) {
    PLATFORM.set(platform);
}

/// Run `f` with the installed `Spl`.
pub fn with_spl<R>(f: impl FnOnce(&dyn Spl) -> R) -> R {
    PLATFORM.with(|p| f(&*p.spl))
}

/// Run `f` with the installed `Mmu`, if any.
pub fn with_mmu<R>(f: impl FnOnce(Option<&dyn Mmu>) -> R) -> R {
    PLATFORM.with(|p| f(p.mmu.as_deref()))
}

/// Run `f` with the installed `TimerSource`.
pub fn with_timer<R>(f: impl FnOnce(&dyn TimerSource) -> R) -> R {
    PLATFORM.with(|p| f(&*p.timer))
}

/// Run `f` with the installed `ContextSwitch`.
pub fn with_ctx_switch<R>(f: impl FnOnce(&dyn ContextSwitch) -> R) -> R {
    PLATFORM.with(|p| f(&*p.ctx_switch))
}
