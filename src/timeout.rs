//! Deadline-ordered timeout list (§4.5, §6 "Timer source").
//!
//! The teacher kernel keeps wake-at-tick bookkeeping inline on each
//! `Thread` (`wake_at_tick`) and scans for expired threads from the PIT ISR.
//! This crate instead keeps one ordered list of deadlines, each carrying
//! either a sleeping thread or a callback, and arms
//! [`crate::platform::TimerSource`] to the single earliest one — the
//! BinaryHeap-of-deadlines idiom used by `asterism-labs-hadron`'s
//! `hadron-kernel/src/sched/timer.rs`, adapted from a Future-waker registry
//! to the spec's thread/callback entries.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

use crate::platform;
use crate::sync::spinlock::Spinlock;

/// What a timeout entry does when its deadline arrives.
pub enum Action {
    /// Wake this thread (make it READY).
    Thread(u32),
    /// Invoke this callback with its two opaque arguments.
    Callback(Box<dyn FnOnce(u64, u64) + Send>, u64, u64),
}

struct Entry {
    id: u64,
    deadline_ns: u64,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts highest.
        other.deadline_ns.cmp(&self.deadline_ns).then_with(|| other.id.cmp(&self.id))
    }
}

struct Engine {
    heap: BinaryHeap<Entry>,
    next_id: u64,
    last_delivered_ns: u64,
}

static ENGINE: Spinlock<Engine> = Spinlock::new(Engine {
    heap: BinaryHeap::new(),
    next_id: 1,
    last_delivered_ns: 0,
});

/// Opaque handle to an armed timeout, usable with [`cancel`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimeoutId(u64);

/// Insert a timeout that wakes `tid` at `deadline_ns`.
pub fn wake_thread_at(deadline_ns: u64, tid: u32) -> TimeoutId {
    insert(deadline_ns, Action::Thread(tid))
}

/// Insert a timeout that invokes `callback(arg1, arg2)` at `deadline_ns`.
pub fn call_at(
    deadline_ns: u64,
    callback: impl FnOnce(u64, u64) + Send + 'static,
    arg1: u64,
    arg2: u64,
) -> TimeoutId {
    insert(deadline_ns, Action::Callback(Box::new(callback), arg1, arg2))
}

fn insert(deadline_ns: u64, action: Action) -> TimeoutId {
    let mut eng = ENGINE.lock();
    let id = eng.next_id;
    eng.next_id += 1;
    eng.heap.push(Entry { id, deadline_ns, action });
    let earliest = eng.heap.peek().map(|e| e.deadline_ns);
    drop(eng);
    if let Some(d) = earliest {
        platform::with_timer(|t| t.arm(d));
    }
    TimeoutId(id)
}

/// Cancel a previously armed timeout. If it carried a sleeping thread, the
/// thread is also woken (matching the spec's "cancel after signal" need).
/// Returns `true` if an entry with this id was found and removed.
pub fn cancel(id: TimeoutId) -> bool {
    let mut eng = ENGINE.lock();
    let items: alloc::vec::Vec<Entry> = eng.heap.drain().collect();
    let mut found = None;
    let mut kept = BinaryHeap::new();
    for e in items {
        if e.id == id.0 {
            found = Some(e);
        } else {
            kept.push(e);
        }
    }
    eng.heap = kept;
    let earliest = eng.heap.peek().map(|e| e.deadline_ns);
    drop(eng);
    if let Some(d) = earliest {
        platform::with_timer(|t| t.arm(d));
    }
    match found {
        Some(Entry { action: Action::Thread(tid), .. }) => {
            crate::sched::make_ready(tid);
            true
        }
        Some(_) => true,
        None => false,
    }
}

/// Called from the timer ISR (or, on the host, by tests) with the current
/// monotonic time. Pops every entry whose deadline has passed, invokes
/// callbacks, and wakes the collected threads. The sequence of delivered
/// deadlines is guaranteed nondecreasing (§8 item 6).
pub fn expired(now_ns: u64) {
    let mut to_wake = alloc::vec::Vec::new();
    let mut to_call = alloc::vec::Vec::new();
    {
        let mut eng = ENGINE.lock();
        while let Some(top) = eng.heap.peek() {
            if top.deadline_ns > now_ns {
                break;
            }
            let entry = eng.heap.pop().unwrap();
            assert!(entry.deadline_ns >= eng.last_delivered_ns, "timeout delivery went backwards");
            eng.last_delivered_ns = entry.deadline_ns;
            match entry.action {
                Action::Thread(tid) => to_wake.push(tid),
                Action::Callback(cb, a1, a2) => to_call.push((cb, a1, a2)),
            }
        }
        let earliest = eng.heap.peek().map(|e| e.deadline_ns);
        drop(eng);
        if let Some(d) = earliest {
            platform::with_timer(|t| t.arm(d));
        }
    }
    for (cb, a1, a2) in to_call {
        cb(a1, a2);
    }
    for tid in to_wake {
        crate::sched::make_ready(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn reset() {
        ensure_platform();
        let mut eng = ENGINE.lock();
        eng.heap.clear();
        eng.last_delivered_ns = 0;
    }

    #[test]
    fn delivers_in_nondecreasing_order() {
        reset();
        static ORDER: AtomicU32 = AtomicU32::new(0);
        static SEEN: Spinlock<alloc::vec::Vec<u64>> = Spinlock::new(alloc::vec::Vec::new());
        let _ = ORDER.load(Ordering::SeqCst);
        call_at(30, |a, _| SEEN.lock().push(a), 30, 0);
        call_at(10, |a, _| SEEN.lock().push(a), 10, 0);
        call_at(20, |a, _| SEEN.lock().push(a), 20, 0);
        expired(100);
        let seen = SEEN.lock();
        assert_eq!(*seen, alloc::vec![10, 20, 30]);
    }

    #[test]
    fn cancel_wakes_sleeping_thread() {
        reset();
        let id = wake_thread_at(1000, 42);
        assert!(cancel(id));
        assert!(!cancel(id), "double cancel reports not-found");
    }
}
