//! Context-switch glue between the scheduler and [`crate::platform::ContextSwitch`].
//!
//! The teacher's `task::context::CpuContext` is a concrete `#[repr(C)]`
//! register file matched against a hand-written x86-64 assembly routine.
//! This crate has no fixed architecture, so the saved context is reduced to
//! the one thing every architecture's calling convention agrees on: a
//! stack-pointer value (§9, "weakly-typed opaque context pointer"). Building
//! and interpreting whatever sits at that stack pointer — the actual
//! register file — is left entirely to the embedder's `ContextSwitch`
//! implementation.

use crate::platform;

/// Switch from the thread owning `save_sp` to the thread whose saved stack
/// pointer is `load_sp`, writing the outgoing thread's new stack pointer
/// back into `*save_sp`. Used by the scheduler when a thread currently
/// running on this CPU is being replaced by another.
///
/// # Safety
/// `save_sp` must point at the `saved_sp` field of the thread currently
/// executing on this CPU, and `load_sp` must be a value previously produced
/// by this function or by [`enter`]'s argument.
pub unsafe fn switch(save_sp: *mut u64, load_sp: u64) {
    platform::with_ctx_switch(|cs| cs.switch(save_sp, load_sp));
}

/// Enter a thread for the first time on this CPU (no prior thread to save),
/// e.g. the per-CPU idle thread at boot. Never returns.
///
/// # Safety
/// `sp` must be a valid saved context.
pub unsafe fn enter(sp: u64) -> ! {
    platform::with_ctx_switch(|cs| cs.enter(sp))
}
