//! Preemptive scheduler: ready queues, thread lifecycle, time-slicing
//! (§4.4). Generalized from the teacher's `task::{thread, context}` and
//! `task::scheduler::*` modules into one struct behind a single lock.

mod context;
mod run_queue;
mod scheduler;
mod thread;

pub use scheduler::{
    block_current, clone_thread, current_cwd, current_tid, exit_current, init, make_ready, reap,
    schedule_tick, set_priority, set_waiter, with_current_thread, yield_now, CloneFlags,
    NUM_PRIORITIES, SLICE_NS,
};
pub use thread::{Thread, ThreadState};
