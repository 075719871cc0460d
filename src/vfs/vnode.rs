//! Vnode: an in-cache reference to a filesystem object (§3 "Vnode", §4.7).

use alloc::collections::VecDeque;
use alloc::string::String;

use super::mount::MountId;

/// The kind of filesystem object a vnode refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VnodeType {
    /// Regular file.
    Reg,
    /// Directory.
    Dir,
    /// Block device.
    Blk,
    /// Character device.
    Chr,
    /// Symbolic link.
    Lnk,
    /// Socket.
    Sock,
    /// Named pipe.
    Fifo,
    /// Placeholder for a freshly-created, not-yet-typed vnode.
    None,
}

/// Reader/writer lock state (§3: "a lock word encoding {SHARED | EXCLUSIVE |
/// WAITER} with a lock-depth counter").
#[derive(Debug, PartialEq, Eq)]
pub enum LockState {
    /// Not locked.
    Unlocked,
    /// Held by one or more shared (read) lockers.
    Shared(u32),
    /// Held exclusively (write).
    Exclusive,
}

/// A cached reference to a filesystem object.
pub struct Vnode {
    /// Owning mount.
    pub mount: MountId,
    /// Filesystem-private handle, interpreted only by that mount's
    /// [`super::mount::Filesystem`].
    pub fs_node: u64,
    /// Object kind.
    pub vtype: VnodeType,
    /// POSIX mode bits.
    pub mode: u32,
    /// Cached size in bytes (authoritative size lives with the filesystem;
    /// this is refreshed on `getattr`).
    pub size: u64,
    /// The (mount, path) key this vnode was cached under.
    pub path: String,
    /// Reference count; the vnode is freed when this reaches zero and the
    /// lock is not held.
    refcount: u32,
    lock: LockState,
    /// tids blocked waiting for the lock to become available, serviced
    /// FIFO — the "waiter semaphore" of §3, expressed directly as a
    /// scheduler wait-list rather than a nested `Semaphore` object, since a
    /// vnode's lock already needs its own spinlock for the word itself.
    waiters: VecDeque<u32>,
}

impl Vnode {
    pub(super) fn new(mount: MountId, fs_node: u64, vtype: VnodeType, mode: u32, size: u64, path: String) -> Self {
        Vnode {
            mount,
            fs_node,
            vtype,
            mode,
            size,
            path,
            refcount: 1,
            lock: LockState::Unlocked,
            waiters: VecDeque::new(),
        }
    }

    /// Current reference count.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub(super) fn incref(&mut self) {
        self.refcount += 1;
    }

    /// Decrement the reference count, returning the new value.
    pub(super) fn decref(&mut self) -> u32 {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount
    }

    /// Whether the lock is currently free.
    pub fn is_unlocked(&self) -> bool {
        self.lock == LockState::Unlocked
    }

    pub(super) fn lock_state(&self) -> &LockState {
        &self.lock
    }

    pub(super) fn set_lock_state(&mut self, state: LockState) {
        self.lock = state;
    }

    pub(super) fn waiters_mut(&mut self) -> &mut VecDeque<u32> {
        &mut self.waiters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_vnode_is_unlocked_with_one_reference() {
        let v = Vnode::new(1, 0, VnodeType::Reg, 0o644, 0, String::from("/a"));
        assert!(v.is_unlocked());
        assert_eq!(v.refcount(), 1);
    }
}
