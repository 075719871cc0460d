//! Syscall number -> handler registration table (§4.8).
//!
//! The teacher's `syscall::table` is a fixed `match` over hand-numbered
//! `SYS_*` constants compiled directly into the dispatcher. This crate
//! generalizes that into a real registration table: a process-wide array
//! mapping a small integer syscall number to a handler function pointer,
//! populated by each subsystem's own `install()` at init time via
//! [`set_syscall`]. An unregistered number returns `ENOSYS` instead of
//! panicking or matching a catch-all arm, which decouples subsystem loading
//! (this crate, or an embedder adding its own syscalls) from the
//! architecture's trap glue.

use crate::errno::Errno;
use crate::sync::spinlock::Spinlock;

/// Largest syscall number this table will hold. Generous headroom over the
/// surface this crate itself registers, so an embedder can add its own
/// syscalls (e.g. display, audio, security - out of scope here) above ours.
pub const MAX_SYSCALLS: usize = 512;

/// A syscall handler: six raw argument words in, a result or `Errno` out.
/// Pointer-sized arguments (addresses, buffer lengths) are passed as `u64`
/// and cast by the handler; this mirrors the teacher's untyped six-register
/// calling convention rather than inventing a typed per-syscall signature.
pub type Handler = fn(&[u64; 6]) -> crate::errno::KResult<i64>;

struct Table {
    slots: [Option<Handler>; MAX_SYSCALLS],
}

static TABLE: Spinlock<Table> = Spinlock::new(Table { slots: [None; MAX_SYSCALLS] });

/// Register `handler` under `num`, overwriting whatever was there before.
/// Called by each subsystem's `install()` (§4.8).
pub fn set_syscall(num: usize, handler: Handler) {
    if num >= MAX_SYSCALLS {
        log::warn!("syscall number {num} out of range, ignoring registration");
        return;
    }
    TABLE.lock().slots[num] = Some(handler);
}

/// Remove whatever handler is registered under `num`, if any.
pub fn clear_syscall(num: usize) {
    if num < MAX_SYSCALLS {
        TABLE.lock().slots[num] = None;
    }
}

/// Look up and invoke the handler registered under `num`. Unregistered
/// numbers return `ENOSYS` rather than the caller's trap glue deciding what
/// to do with an out-of-range index.
pub fn dispatch(num: usize, args: &[u64; 6]) -> crate::errno::KResult<i64> {
    let handler = if num < MAX_SYSCALLS { TABLE.lock().slots[num] } else { None };
    match handler {
        Some(h) => h(args),
        None => Err(Errno::ENOSYS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_one(_args: &[u64; 6]) -> crate::errno::KResult<i64> {
        Ok(1)
    }

    #[test]
    fn unregistered_number_returns_enosys() {
        assert_eq!(dispatch(511, &[0; 6]), Err(Errno::ENOSYS));
    }

    #[test]
    fn registered_handler_is_invoked() {
        set_syscall(500, ok_one);
        assert_eq!(dispatch(500, &[0; 6]), Ok(1));
        clear_syscall(500);
        assert_eq!(dispatch(500, &[0; 6]), Err(Errno::ENOSYS));
    }

    #[test]
    fn out_of_range_registration_is_ignored_not_panicking() {
        set_syscall(MAX_SYSCALLS + 1, ok_one);
    }
}
