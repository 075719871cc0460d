//! Blocking message queue (§4.5).
//!
//! Extends the teacher's `ipc::message_queue::MessageQueue` — bounded,
//! non-blocking `send`/`receive` over a `VecDeque<Message>` behind one
//! spinlock — with the specification's blocking semantics: `send` wakes
//! waiters directly instead of leaving them to poll, and `get` blocks the
//! calling thread via the scheduler instead of returning `None`.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::sched::{self, ThreadState};
use crate::sync::spinlock::Spinlock;

/// Maximum payload size for a single message, in bytes.
pub const MAX_MSG_SIZE: usize = 256;
/// Maximum number of messages queued before `send` rejects further sends.
pub const MAX_QUEUE_DEPTH: usize = 64;

/// A single message, carrying sender identity, an application type tag, and
/// a payload.
#[derive(Clone)]
pub struct Message {
    /// tid of the sending thread.
    pub sender_tid: u32,
    /// Application-defined message type identifier.
    pub msg_type: u32,
    /// Payload, at most [`MAX_MSG_SIZE`] bytes.
    pub data: Vec<u8>,
}

struct Inner {
    messages: VecDeque<Message>,
    waiters: VecDeque<u32>,
    max_depth: usize,
}

/// A blocking, bounded message queue (§4.5).
pub struct MessageQueue {
    inner: Spinlock<Inner>,
}

impl MessageQueue {
    /// Create an empty queue with the default depth limit.
    pub const fn new() -> Self {
        MessageQueue {
            inner: Spinlock::new(Inner {
                messages: VecDeque::new(),
                waiters: VecDeque::new(),
                max_depth: MAX_QUEUE_DEPTH,
            }),
        }
    }

    /// `send(q, msg)`: append under the queue lock; if there are waiters,
    /// wake all of them (they were off every ready queue and must now race
    /// to be the one that actually pops the message). Returns `false` if the
    /// queue is full or the message exceeds [`MAX_MSG_SIZE`].
    pub fn send(&self, msg: Message) -> bool {
        if msg.data.len() > MAX_MSG_SIZE {
            return false;
        }
        let woken = {
            let mut inner = self.inner.lock();
            if inner.messages.len() >= inner.max_depth {
                return false;
            }
            inner.messages.push_back(msg);
            core::mem::take(&mut inner.waiters)
        };
        for tid in woken {
            sched::make_ready(tid);
        }
        true
    }

    /// `get(q)`: pop the head if present; otherwise block the calling
    /// thread on this queue's waiter list until woken by a `send`.
    pub fn get(&self) -> Message {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(msg) = inner.messages.pop_front() {
                    return msg;
                }
                let me = sched::current_tid();
                inner.waiters.push_back(me);
            }
            sched::block_current(ThreadState::MsgWait);
        }
    }

    /// `get_nowait`: non-blocking receive, `None` if empty.
    pub fn get_nowait(&self) -> Option<Message> {
        self.inner.lock().messages.pop_front()
    }

    /// Whether any message is pending.
    pub fn has_messages(&self) -> bool {
        !self.inner.lock().messages.is_empty()
    }

    /// Number of messages currently queued.
    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;

    fn msg(tag: u32) -> Message {
        Message { sender_tid: 1, msg_type: tag, data: Vec::new() }
    }

    #[test]
    fn send_then_get_nowait_round_trips() {
        ensure_platform();
        let q = MessageQueue::new();
        assert!(q.send(msg(7)));
        assert_eq!(q.get_nowait().unwrap().msg_type, 7);
        assert!(q.get_nowait().is_none());
    }

    #[test]
    fn send_rejects_past_max_depth() {
        ensure_platform();
        let q = MessageQueue::new();
        for _ in 0..MAX_QUEUE_DEPTH {
            assert!(q.send(msg(0)));
        }
        assert!(!q.send(msg(0)));
    }

    #[test]
    fn send_rejects_oversized_payload() {
        ensure_platform();
        let q = MessageQueue::new();
        let big = Message { sender_tid: 1, msg_type: 0, data: alloc::vec![0u8; MAX_MSG_SIZE + 1] };
        assert!(!q.send(big));
    }

    #[test]
    fn send_wakes_every_waiter_recorded_on_the_list() {
        ensure_platform();
        let q = MessageQueue::new();
        {
            let mut inner = q.inner.lock();
            inner.waiters.push_back(10);
            inner.waiters.push_back(11);
        }
        assert!(q.send(msg(1)));
        assert!(q.inner.lock().waiters.is_empty());
    }
}
