//! Scheduler core: ready queues, selection, time-slicing, thread lifecycle
//! (§4.4).
//!
//! Generalized from the teacher's `task::scheduler::{mod, lifecycle,
//! priority, wait}.rs`. The teacher hardcodes per-CPU bookkeeping as a set
//! of top-level `static` arrays (`PER_CPU_CURRENT_TID`, `PER_CPU_IN_SCHEDULER`,
//! ...) indexed by `cpu_id`; here they are fields of one `Scheduler` struct
//! behind a single lock, matching the spec's "one scheduler lock protects
//! all of them" (§4.4) and the crate's general preference for an explicit
//! struct over scattered statics. Per-thread bookkeeping is reduced to what
//! §3 actually names — the teacher's `Thread` additionally carries
//! capabilities, signals, FPU state, and session/process-group ids that
//! belong to subsystems outside this crate's scope.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::mm::vm::MapId;
use crate::sync::spinlock::Spinlock;
use crate::timeout::{self, TimeoutId};
use crate::{platform, KResult};
use crate::errno::Errno;

use super::context;
use super::run_queue::RunQueue;
use super::thread::{Thread, ThreadState, TidPool};

/// Number of priority levels, 0 = highest (§4.4).
pub const NUM_PRIORITIES: usize = 32;
/// Default time-slice quantum.
pub const SLICE_NS: u64 = 5_000_000;
/// Upper bound on live threads, sizing the tid pool and lookup table.
pub const MAX_THREADS: usize = 4096;

struct PerCpu {
    current_tid: Option<u32>,
    idle_tid: u32,
    slice_timeout: Option<TimeoutId>,
    /// >0 while inside an IRQ handler; `schedule` skips the actual context
    /// switch in that case, matching the teacher's IRQ-epilogue convention.
    irq_nesting: u32,
}

struct Scheduler {
    threads: Vec<Option<Box<Thread>>>,
    tid_pool: TidPool,
    run_queue: RunQueue,
    per_cpu: Vec<PerCpu>,
}

impl Scheduler {
    fn thread(&self, tid: u32) -> Option<&Thread> {
        self.threads.get(tid as usize)?.as_deref()
    }

    fn thread_mut(&mut self, tid: u32) -> Option<&mut Thread> {
        self.threads.get_mut(tid as usize)?.as_deref_mut()
    }

    fn insert_thread(&mut self, t: Thread) {
        let tid = t.tid as usize;
        if tid >= self.threads.len() {
            self.threads.resize_with(tid + 1, || None);
        }
        self.threads[tid] = Some(Box::new(t));
    }
}

static SCHEDULER: Spinlock<Option<Scheduler>> = Spinlock::new(None);

/// Bring up the scheduler: one idle thread per CPU, tid pool sized
/// [`MAX_THREADS`]. Called once from [`crate::init`].
pub fn init() {
    let num_cpus = platform::with_spl(|s| s.cpu_count());
    let mut tid_pool = TidPool::new(MAX_THREADS as u32);
    let mut threads = Vec::new();
    let mut per_cpu = Vec::with_capacity(num_cpus);
    for cpu in 0..num_cpus {
        let tid = if cpu == 0 {
            // tid 1 is reserved for init elsewhere; idle threads are
            // carved out of the pool like any other thread and simply
            // never enter a ready queue.
            tid_pool.alloc().expect("tid pool exhausted bringing up idle threads")
        } else {
            tid_pool.alloc().expect("tid pool exhausted bringing up idle threads")
        };
        let mut idle = Thread::new(tid, 0, tid, NUM_PRIORITIES - 1, 0);
        idle.state = ThreadState::Idle;
        let idx = tid as usize;
        if idx >= threads.len() {
            threads.resize_with(idx + 1, || None);
        }
        threads[idx] = Some(Box::new(idle));
        per_cpu.push(PerCpu { current_tid: Some(tid), idle_tid: tid, slice_timeout: None, irq_nesting: 0 });
    }
    *SCHEDULER.lock() = Some(Scheduler {
        threads,
        tid_pool,
        run_queue: RunQueue::new(NUM_PRIORITIES),
        per_cpu,
    });
}

fn cpu_id() -> usize {
    platform::with_spl(|s| s.cpu_id())
}

/// The tid of the thread currently running on this CPU.
pub fn current_tid() -> u32 {
    let cpu = cpu_id();
    let guard = SCHEDULER.lock();
    let sched = guard.as_ref().expect("scheduler not initialized");
    sched.per_cpu[cpu].current_tid.unwrap_or(0)
}

/// Mark `tid` READY and place it on its priority's ready queue. Does not by
/// itself force a reschedule — the next voluntary yield or timer tick will
/// pick it up, matching the teacher's `wake_thread`.
pub fn make_ready(tid: u32) {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    if let Some(t) = sched.thread_mut(tid) {
        if t.state == ThreadState::Ready || t.state == ThreadState::Running {
            return;
        }
        t.state = ThreadState::Ready;
        let p = t.priority;
        sched.run_queue.enqueue(p, tid);
    }
}

/// Block the current thread with the given state (the caller — a mutex,
/// semaphore, or message queue — has already linked it onto its own waiter
/// list) and switch to another runnable thread.
pub fn block_current(state: ThreadState) {
    debug_assert!(matches!(state, ThreadState::Sleeping | ThreadState::MsgWait));
    let cpu = cpu_id();
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    let tid = sched.per_cpu[cpu].current_tid.expect("no current thread to block");
    if let Some(t) = sched.thread_mut(tid) {
        t.state = state;
    }
    reschedule_locked(guard, cpu, &[]);
}

/// Voluntary yield: give up the CPU, remaining READY, possibly also waking
/// `to_ready` (threads a caller has just unblocked, e.g. a mutex unlock's
/// FIFO pop) in the same scheduling decision.
pub fn yield_now(to_ready: &[u32]) {
    let cpu = cpu_id();
    let guard = SCHEDULER.lock();
    reschedule_locked(guard, cpu, to_ready);
}

/// Called from the timer ISR when this CPU's slice has expired.
pub fn schedule_tick() {
    let cpu = cpu_id();
    let guard = SCHEDULER.lock();
    reschedule_locked(guard, cpu, &[]);
}

/// Core of `schedule(list)` (§4.4): enqueue `to_ready`, requeue the current
/// thread if it is still RUNNING and not idle, select the next thread, and
/// context-switch to it unless we are nested inside an IRQ.
fn reschedule_locked(
    mut guard: crate::sync::spinlock::SpinlockGuard<'_, Option<Scheduler>>,
    cpu: usize,
    to_ready: &[u32],
) {
    let sched = guard.as_mut().expect("scheduler not initialized");
    for &tid in to_ready {
        if let Some(t) = sched.thread_mut(tid) {
            if t.state != ThreadState::Ready && t.state != ThreadState::Running {
                t.state = ThreadState::Ready;
                let p = t.priority;
                sched.run_queue.enqueue(p, tid);
            }
        }
    }

    let old_tid = sched.per_cpu[cpu].current_tid;
    let old_is_idle = old_tid.map(|t| sched.per_cpu[cpu].idle_tid == t).unwrap_or(false);
    if let Some(tid) = old_tid {
        if !old_is_idle {
            if let Some(t) = sched.thread_mut(tid) {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Ready;
                    let p = t.priority;
                    sched.run_queue.enqueue(p, tid);
                }
            }
        }
    }

    let new_tid = match sched.run_queue.dequeue_highest(0) {
        Some((_, tid)) => tid,
        None => sched.per_cpu[cpu].idle_tid,
    };
    if let Some(t) = sched.thread_mut(new_tid) {
        t.state = ThreadState::Running;
    }
    sched.per_cpu[cpu].current_tid = Some(new_tid);

    if let Some(prev) = sched.per_cpu[cpu].slice_timeout.take() {
        timeout::cancel(prev);
    }
    if !sched.run_queue.is_empty() {
        let deadline = platform::with_timer(|t| t.monotonic_ns()) + SLICE_NS;
        let armed_for = new_tid;
        let id = timeout::call_at(
            deadline,
            move |cpu_as_u64, armed_tid| {
                let cpu = cpu_as_u64 as usize;
                let guard = SCHEDULER.lock();
                let still_current = guard
                    .as_ref()
                    .and_then(|s| s.per_cpu.get(cpu))
                    .and_then(|pc| pc.current_tid)
                    == Some(armed_tid as u32);
                if still_current {
                    reschedule_locked(guard, cpu, &[]);
                }
            },
            cpu as u64,
            armed_for as u64,
        );
        sched.per_cpu[cpu].slice_timeout = Some(id);
    }

    if sched.per_cpu[cpu].irq_nesting > 0 {
        // The IRQ epilogue performs the switch on return; nothing more to do.
        return;
    }

    if old_tid == Some(new_tid) {
        return;
    }

    let (save_ptr, load_sp) = {
        let old_saved_sp: *mut u64 = match old_tid {
            Some(tid) => &mut sched.thread_mut(tid).expect("current thread vanished").saved_sp as *mut u64,
            None => core::ptr::null_mut(),
        };
        let load_sp = sched.thread(new_tid).expect("selected thread vanished").saved_sp;
        (old_saved_sp, load_sp)
    };
    guard.release_no_irq_restore();
    if save_ptr.is_null() {
        unsafe { context::enter(load_sp) }
    } else {
        unsafe { context::switch(save_ptr, load_sp) }
    }
}

/// `clone`: create a new thread sharing (CLONE_VM) or duplicating the
/// parent's address space, and the same for the file-descriptor set
/// (CLONE_FILES). The child is made runnable synchronously; the parent does
/// not yield (§4.4 "Thread creation").
pub struct CloneFlags {
    /// Share the parent's address space instead of COW-duplicating it.
    pub clone_vm: bool,
    /// Share the parent's file-descriptor table instead of cloning it.
    pub clone_files: bool,
}

pub fn clone_thread(
    parent_tid: u32,
    flags: CloneFlags,
    entry_sp_seed: u64,
) -> KResult<u32> {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    let tid = sched.tid_pool.alloc().ok_or(Errno::EAGAIN)?;
    let (parent_pid, priority, parent_vm, parent_fds, uid, gid, cwd) = {
        let parent = sched.thread(parent_tid).ok_or(Errno::ESRCH)?;
        (
            parent.pid,
            parent.priority,
            parent.vm_map,
            parent.fd_table.clone(),
            parent.uid,
            parent.gid,
            parent.cwd.clone(),
        )
    };

    let child_vm: Option<MapId> = match (parent_vm, flags.clone_vm) {
        (Some(map), true) => Some(map),
        (Some(map), false) => {
            let new_pd = platform::with_mmu(|mmu| match mmu {
                Some(mmu) => mmu.new_map(),
                None => Ok(0),
            })?;
            Some(crate::mm::vm::dup(map, new_pd)?)
        }
        (None, _) => None,
    };

    let mut child = Thread::new(tid, parent_tid, parent_pid, priority, entry_sp_seed);
    child.vm_map = child_vm;
    child.fd_table = if flags.clone_files { parent_fds } else { parent_fds.clone() };
    child.uid = uid;
    child.gid = gid;
    child.cwd = cwd;
    child.state = ThreadState::Ready;
    sched.insert_thread(child);
    let p = priority;
    sched.run_queue.enqueue(p, tid);
    Ok(tid)
}

/// Terminate the current thread. Wakes any `waitpid` waiter recorded on its
/// control block, then switches away; the caller never returns (§4.4
/// "Thread exit").
pub fn exit_current(code: i32) -> ! {
    let cpu = cpu_id();
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    let tid = sched.per_cpu[cpu].current_tid.expect("no current thread");
    let (waiter, clear_child_tid) = {
        let t = sched.thread_mut(tid).expect("current thread vanished");
        t.state = ThreadState::Exiting;
        t.exit_code = Some(code);
        (t.waiting_tid.take(), t.clear_child_tid)
    };
    drop(guard);
    if clear_child_tid != 0 {
        // Safety: `clear_child_tid` is only ever set by `set_tid_address`,
        // which requires the embedder to hand in an address valid in the
        // calling thread's own address space.
        unsafe {
            (clear_child_tid as *mut u32).write(0);
        }
        crate::futex::wake_raw(clear_child_tid);
    }
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    if let Some(waiter_tid) = waiter {
        if let Some(w) = sched.thread_mut(waiter_tid) {
            if w.state != ThreadState::Ready && w.state != ThreadState::Running {
                w.state = ThreadState::Ready;
                let p = w.priority;
                sched.run_queue.enqueue(p, waiter_tid);
            }
        }
    }
    reschedule_locked(guard, cpu, &[]);
    unreachable!("exited thread resumed after being scheduled away");
}

/// Free an EXITING thread's kernel stack and tid once it is no longer the
/// current thread on any CPU — called by the reaper (`waitpid`) after
/// collecting the exit code. Separated from [`exit_current`] because the
/// stack a thread exits *on* cannot be freed until some other stack is
/// active (§4.4).
pub fn reap(tid: u32) -> Option<i32> {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    let still_running = sched.per_cpu.iter().any(|pc| pc.current_tid == Some(tid));
    if still_running {
        return None;
    }
    let idx = tid as usize;
    let thread = sched.threads.get_mut(idx)?.take()?;
    if thread.state != ThreadState::Exiting {
        sched.threads[idx] = Some(thread);
        return None;
    }
    sched.tid_pool.release(tid);
    thread.exit_code
}

/// Register that the calling thread wants to be woken when `target`
/// exits (`waitpid`); returns immediately with the exit code if `target`
/// has already exited.
pub fn set_waiter(target: u32, waiter: u32) -> KResult<Option<i32>> {
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    let t = sched.thread_mut(target).ok_or(Errno::ESRCH)?;
    if t.state == ThreadState::Exiting {
        return Ok(t.exit_code);
    }
    t.waiting_tid = Some(waiter);
    Ok(None)
}

/// Run `f` with mutable access to the current thread's control block. Used
/// by the VFS layer to resolve fds and cwd without threading `&mut Thread`
/// through every syscall (§4.7).
pub fn with_current_thread<R>(f: impl FnOnce(&mut super::thread::Thread) -> R) -> R {
    let cpu = cpu_id();
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    let tid = sched.per_cpu[cpu].current_tid.expect("no current thread");
    let t = sched.thread_mut(tid).expect("current thread vanished");
    f(t)
}

/// The current thread's working directory.
pub fn current_cwd() -> alloc::string::String {
    with_current_thread(|t| t.cwd.clone())
}

/// Change a thread's priority (clamped to the valid range).
pub fn set_priority(tid: u32, priority: usize) {
    let priority = priority.min(NUM_PRIORITIES - 1);
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    if let Some(t) = sched.thread_mut(tid) {
        if t.state == ThreadState::Ready {
            sched.run_queue.remove(tid);
            t.priority = priority;
            sched.run_queue.enqueue(priority, tid);
        } else {
            t.priority = priority;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;

    fn reset() {
        ensure_platform();
        init();
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        reset();
        assert_eq!(current_tid(), {
            let guard = SCHEDULER.lock();
            guard.as_ref().unwrap().per_cpu[0].idle_tid
        });
    }

    #[test]
    fn make_ready_then_yield_switches_to_new_thread() {
        reset();
        let parent = current_tid();
        let child = clone_thread(parent, CloneFlags { clone_vm: true, clone_files: true }, 0).unwrap();
        yield_now(&[]);
        assert_eq!(current_tid(), child);
    }

    #[test]
    fn exit_wakes_registered_waiter() {
        reset();
        let parent = current_tid();
        let child = clone_thread(parent, CloneFlags { clone_vm: true, clone_files: true }, 0).unwrap();
        set_waiter(child, parent).unwrap();
        // Switch to the child, then have it exit; with the mock context
        // switch this runs inline rather than on a real second stack.
        yield_now(&[]);
        assert_eq!(current_tid(), child);
        let mut guard = SCHEDULER.lock();
        {
            let sched = guard.as_mut().unwrap();
            if let Some(t) = sched.thread_mut(child) {
                t.state = ThreadState::Exiting;
                t.exit_code = Some(7);
            }
            if let Some(w) = sched.thread_mut(parent) {
                w.state = ThreadState::Ready;
                let p = w.priority;
                sched.run_queue.enqueue(p, parent);
            }
        }
        reschedule_locked(guard, 0, &[]);
        assert_eq!(current_tid(), parent);
        assert_eq!(reap(child), Some(7));
    }

    #[test]
    fn set_priority_moves_ready_thread_between_levels() {
        reset();
        let parent = current_tid();
        let child = clone_thread(parent, CloneFlags { clone_vm: true, clone_files: true }, 0).unwrap();
        set_priority(child, 0);
        let guard = SCHEDULER.lock();
        let sched = guard.as_ref().unwrap();
        assert_eq!(sched.thread(child).unwrap().priority, 0);
    }
}
