//! Address-keyed wait queue backing `FUTEX_WAIT`/`FUTEX_WAKE` and the
//! `clear_child_tid` wake-on-exit handshake (§4.4 "Thread exit", §4.8
//! `SYS_futex`).
//!
//! [`crate::timeout`] orders its entries by deadline in a `BinaryHeap` and
//! has no way to mass-cancel every entry matching a given argument — exactly
//! what waking every waiter on one address needs. This module is instead a
//! `BTreeMap` of per-address FIFO waiter lists, grounded on the same
//! lock-a-`VecDeque`-and-block shape as [`crate::msgqueue::MessageQueue`]
//! and [`crate::sync::semaphore::Semaphore`], keyed by address instead of
//! carrying its own queue identity.

use alloc::collections::{BTreeMap, VecDeque};

use crate::errno::{Errno, KResult};
use crate::sched::{self, ThreadState};
use crate::sync::spinlock::Spinlock;
use crate::{platform, timeout};

static WAITERS: Spinlock<BTreeMap<u64, VecDeque<u32>>> = Spinlock::new(BTreeMap::new());

/// Read the 32-bit word at `addr` as it currently stands in the calling
/// thread's address space.
///
/// Safety: `addr` must be a valid, aligned address in the current address
/// space; callers (the `futex` syscall handler) are responsible for that,
/// matching this crate's "syscalls run with the caller's address space
/// already active" model (no separate user-copy layer, §4.8).
unsafe fn read_u32(addr: u64) -> u32 {
    core::ptr::read_volatile(addr as *const u32)
}

/// `FUTEX_WAIT`: if `*addr != expected`, return `EAGAIN` immediately
/// (someone already changed the value — don't block on stale state).
/// Otherwise block until woken by [`wake`] or until `deadline_ns`, returning
/// `ETIMEDOUT` in the latter case. `deadline_ns = None` waits forever.
pub fn wait(addr: u64, expected: u32, deadline_ns: Option<u64>) -> KResult<()> {
    if unsafe { read_u32(addr) } != expected {
        return Err(Errno::EAGAIN);
    }
    let tid = sched::current_tid();
    WAITERS.lock().entry(addr).or_default().push_back(tid);

    let timeout_id = deadline_ns.map(|d| timeout::wake_thread_at(d, tid));
    sched::block_current(ThreadState::MsgWait);
    if let Some(id) = timeout_id {
        timeout::cancel(id);
    }

    let mut waiters = WAITERS.lock();
    let still_waiting = waiters
        .get_mut(&addr)
        .map(|list| {
            let had = list.iter().position(|&t| t == tid).map(|pos| list.remove(pos));
            had.is_some()
        })
        .unwrap_or(false);
    if let Some(list) = waiters.get(&addr) {
        if list.is_empty() {
            waiters.remove(&addr);
        }
    }
    drop(waiters);

    if still_waiting {
        // Still on the list: nobody called wake() for us, so the timeout
        // fired (or this is a spurious block_current return with no
        // deadline at all, which cannot happen since then timeout_id is
        // None and we'd never have been removed by anything else).
        Err(Errno::ETIMEDOUT)
    } else {
        Ok(())
    }
}

/// `FUTEX_WAKE`: wake up to `max` waiters on `addr`, oldest first. Returns
/// the number actually woken.
pub fn wake(addr: u64, max: u32) -> u32 {
    let woken = {
        let mut waiters = WAITERS.lock();
        let mut woken = alloc::vec::Vec::new();
        if let Some(list) = waiters.get_mut(&addr) {
            for _ in 0..max {
                match list.pop_front() {
                    Some(tid) => woken.push(tid),
                    None => break,
                }
            }
            if list.is_empty() {
                waiters.remove(&addr);
            }
        }
        woken
    };
    let count = woken.len() as u32;
    for tid in woken {
        sched::make_ready(tid);
    }
    count
}

/// Wake every waiter on `addr`. Used by `exit_current`'s `clear_child_tid`
/// handshake, which has no `max` of its own to honor (§4.4).
pub(crate) fn wake_raw(addr: u64) {
    wake(addr, u32::MAX);
}

/// Current monotonic time, for syscall handlers translating a relative
/// `timespec` timeout into the absolute deadline [`wait`] expects.
pub fn now_ns() -> u64 {
    platform::with_timer(|t| t.monotonic_ns())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn reset() {
        ensure_platform();
        sched::init();
        WAITERS.lock().clear();
    }

    #[test]
    fn wait_returns_eagain_when_value_already_changed() {
        reset();
        let word = AtomicU32::new(1);
        let addr = &word as *const _ as u64;
        assert_eq!(wait(addr, 0, None), Err(Errno::EAGAIN));
    }

    #[test]
    fn wake_returns_zero_when_nobody_waiting() {
        reset();
        assert_eq!(wake(0x1000, 1), 0);
    }

    #[test]
    fn wake_removes_woken_threads_from_the_list() {
        reset();
        {
            let mut waiters = WAITERS.lock();
            let list = waiters.entry(0x2000).or_default();
            list.push_back(10);
            list.push_back(11);
        }
        assert_eq!(wake(0x2000, 1), 1);
        let waiters = WAITERS.lock();
        assert_eq!(waiters.get(&0x2000).unwrap().front(), Some(&11));
    }

    #[test]
    fn wake_raw_drains_every_waiter_on_the_address() {
        reset();
        {
            let mut waiters = WAITERS.lock();
            let list = waiters.entry(0x3000).or_default();
            list.push_back(20);
            list.push_back(21);
        }
        wake_raw(0x3000);
        assert!(WAITERS.lock().get(&0x3000).is_none());
    }

    #[test]
    fn now_ns_reads_the_installed_timer() {
        reset();
        assert!(now_ns() >= 1);
    }
}
