//! Time syscall handlers (§6 "Time").
//!
//! Grounded on [`crate::platform::TimerSource`] (monotonic/realtime
//! nanosecond clocks the embedder supplies, §9 "Timer source") and
//! [`crate::timeout`]/[`crate::futex`]'s deadline-based sleep primitive,
//! the same "block until woken or deadline" shape `clock_nanosleep` needs.
//! The teacher has no clock syscalls of its own (its userland reads the PIT
//! tick count directly), so this module is built from the spec's timer
//! source contract rather than a teacher counterpart.

use crate::errno::{Errno, KResult};
use crate::sched::{self, ThreadState};
use crate::{platform, timeout};

use super::helpers::is_valid_user_ptr;
use super::table::set_syscall;

pub const SYS_CLOCK_GETRES: usize = 150;
pub const SYS_CLOCK_GETTIME: usize = 151;
pub const SYS_CLOCK_SETTIME: usize = 152;
pub const SYS_CLOCK_NANOSLEEP: usize = 153;
pub const SYS_NANOSLEEP: usize = 154;

/// Clock ids this kernel knows about, matching the two the timer-source
/// contract actually distinguishes (§9).
const CLOCK_REALTIME: u64 = 0;
const CLOCK_MONOTONIC: u64 = 1;

pub(crate) fn install() {
    set_syscall(SYS_CLOCK_GETRES, sys_clock_getres);
    set_syscall(SYS_CLOCK_GETTIME, sys_clock_gettime);
    set_syscall(SYS_CLOCK_SETTIME, sys_clock_settime);
    set_syscall(SYS_CLOCK_NANOSLEEP, sys_clock_nanosleep);
    set_syscall(SYS_NANOSLEEP, sys_nanosleep);
}

fn clock_now_ns(clock_id: u64) -> KResult<u64> {
    match clock_id {
        CLOCK_REALTIME => Ok(platform::with_timer(|t| t.realtime_ns())),
        CLOCK_MONOTONIC => Ok(platform::with_timer(|t| t.monotonic_ns())),
        _ => Err(Errno::EINVAL),
    }
}

/// Write a `{sec: u64, nsec: u64}` timespec at `ptr`, the same raw-word
/// layout [`super::vfs::write_attr`]'s sibling helpers use rather than a
/// libc ABI struct this crate has no reason to assume.
unsafe fn write_timespec(ptr: u64, total_ns: u64) -> KResult<()> {
    if !is_valid_user_ptr(ptr, 16) {
        return Err(Errno::EFAULT);
    }
    let sec = total_ns / 1_000_000_000;
    let nsec = total_ns % 1_000_000_000;
    (ptr as *mut u64).write(sec);
    ((ptr + 8) as *mut u64).write(nsec);
    Ok(())
}

unsafe fn read_timespec(ptr: u64) -> KResult<u64> {
    if !is_valid_user_ptr(ptr, 16) {
        return Err(Errno::EFAULT);
    }
    let sec = (ptr as *const u64).read();
    let nsec = ((ptr + 8) as *const u64).read();
    Ok(sec.saturating_mul(1_000_000_000).saturating_add(nsec))
}

fn sys_clock_getres(args: &[u64; 6]) -> KResult<i64> {
    clock_now_ns(args[0])?;
    if args[1] != 0 {
        unsafe { write_timespec(args[1], 1)? };
    }
    Ok(0)
}

fn sys_clock_gettime(args: &[u64; 6]) -> KResult<i64> {
    let now = clock_now_ns(args[0])?;
    unsafe { write_timespec(args[1], now)? };
    Ok(0)
}

fn sys_clock_settime(args: &[u64; 6]) -> KResult<i64> {
    if args[0] != CLOCK_REALTIME {
        return Err(Errno::EINVAL);
    }
    let ns = unsafe { read_timespec(args[1])? };
    platform::with_timer(|t| t.set_realtime_ns(ns));
    Ok(0)
}

/// Block the calling thread until `deadline_ns`, or immediately if that
/// deadline has already passed. Built on the same
/// arm-a-timeout/block/cancel/recheck pattern as
/// [`crate::sync::semaphore::Semaphore::timedwait`], minus the
/// wait-list membership (there is nothing to wake this thread early: a
/// sleep is not waiting on any resource, only the clock).
fn sleep_until(deadline_ns: u64) -> KResult<()> {
    let tid = sched::current_tid();
    if deadline_ns <= platform::with_timer(|t| t.monotonic_ns()) {
        return Ok(());
    }
    timeout::wake_thread_at(deadline_ns, tid);
    sched::block_current(ThreadState::Sleeping);
    Ok(())
}

/// `clock_nanosleep(clock_id, flags, request, remain)`. `flags` bit 0 is
/// `TIMER_ABSTIME`; `remain` is not written back since a sleep here cannot
/// be interrupted by a signal for this kernel to report leftover time on.
fn sys_clock_nanosleep(args: &[u64; 6]) -> KResult<i64> {
    const TIMER_ABSTIME: u64 = 1;
    let clock_id = args[0];
    let absolute = args[1] & TIMER_ABSTIME != 0;
    let requested = unsafe { read_timespec(args[2])? };
    let deadline = if absolute {
        requested
    } else {
        clock_now_ns(clock_id)?.saturating_add(requested)
    };
    sleep_until(deadline)
        .map(|_| 0)
}

fn sys_nanosleep(args: &[u64; 6]) -> KResult<i64> {
    let requested = unsafe { read_timespec(args[0])? };
    let now = platform::with_timer(|t| t.monotonic_ns());
    sleep_until(now.saturating_add(requested)).map(|_| 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;

    fn reset() {
        ensure_platform();
        sched::init();
    }

    #[test]
    fn clock_gettime_rejects_an_unknown_clock_id() {
        reset();
        assert_eq!(sys_clock_gettime(&[99, 0x4000, 0, 0, 0, 0]), Err(Errno::EINVAL));
    }

    #[test]
    fn clock_gettime_writes_a_timespec() {
        reset();
        let mut buf = [0u64; 2];
        let addr = buf.as_mut_ptr() as u64;
        assert_eq!(sys_clock_gettime(&[CLOCK_MONOTONIC, addr, 0, 0, 0, 0]), Ok(0));
        assert!(buf[0] > 0 || buf[1] > 0);
    }

    #[test]
    fn nanosleep_with_a_past_deadline_returns_immediately() {
        reset();
        let ts: [u64; 2] = [0, 0];
        let addr = ts.as_ptr() as u64;
        assert_eq!(sys_nanosleep(&[addr, 0, 0, 0, 0, 0]), Ok(0));
    }
}
