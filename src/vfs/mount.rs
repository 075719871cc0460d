//! Mount table and filesystem-personality vtable (§4.7, §6).
//!
//! The spec describes a `vfsops` vtable (mount/unmount/sync/vget/statfs)
//! and a separate `vnops` vtable (open/close/read/write/... per vnode).
//! This crate merges both into one [`Filesystem`] trait per mount: every
//! registered personality in the pack (the teacher's own `devfs`, the
//! reference `ramfs` added below) is small enough that the split bought the
//! teacher nothing but indirection, and a single vtable keeps `namei`'s
//! dispatch (§4.7, "dispatch to the vtable") to one lookup instead of two.
//! Noted as a deliberate simplification in the grounding ledger.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};

/// A directory entry returned by [`Filesystem::readdir`].
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// Entry name (no path separators).
    pub name: String,
    /// Filesystem-private node handle for this entry.
    pub node: u64,
    /// Type of the named node.
    pub vtype: super::vnode::VnodeType,
}

/// Attributes returned by [`Filesystem::getattr`], the core of `fstat`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Attr {
    /// Size in bytes.
    pub size: u64,
    /// POSIX mode bits.
    pub mode: u32,
}

/// Aggregate filesystem statistics for `statfs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStat {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub free_blocks: u64,
}

/// A mounted filesystem personality. Every fallible operation a concrete
/// filesystem doesn't implement defaults to `EOPNOTSUPP`, matching the
/// spec's "unsupported ops use shared null/einval stubs" (§6).
pub trait Filesystem: Send + Sync {
    /// The root node's filesystem-private handle.
    fn root(&self) -> u64;

    /// Look up `name` inside the directory node `dir`.
    fn lookup(&self, dir: u64, name: &str) -> KResult<u64> {
        let _ = (dir, name);
        Err(Errno::EOPNOTSUPP)
    }

    /// Create a regular file named `name` inside `dir`.
    fn create(&self, dir: u64, name: &str, mode: u32) -> KResult<u64> {
        let _ = (dir, name, mode);
        Err(Errno::EOPNOTSUPP)
    }

    /// Create a directory named `name` inside `dir`.
    fn mkdir(&self, dir: u64, name: &str, mode: u32) -> KResult<u64> {
        let _ = (dir, name, mode);
        Err(Errno::EOPNOTSUPP)
    }

    /// Remove the non-directory entry `name` from `dir`.
    fn remove(&self, dir: u64, name: &str) -> KResult<()> {
        let _ = (dir, name);
        Err(Errno::EOPNOTSUPP)
    }

    /// Remove the empty directory entry `name` from `dir`.
    fn rmdir(&self, dir: u64, name: &str) -> KResult<()> {
        let _ = (dir, name);
        Err(Errno::EOPNOTSUPP)
    }

    /// Atomically move `old_name` in `old_dir` to `new_name` in `new_dir`.
    fn rename(&self, old_dir: u64, old_name: &str, new_dir: u64, new_name: &str) -> KResult<()> {
        let _ = (old_dir, old_name, new_dir, new_name);
        Err(Errno::EOPNOTSUPP)
    }

    /// Read up to `buf.len()` bytes from `node` starting at `offset`.
    fn read(&self, node: u64, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let _ = (node, offset, buf);
        Err(Errno::EOPNOTSUPP)
    }

    /// Write `buf` to `node` starting at `offset`, growing the node if
    /// needed.
    fn write(&self, node: u64, offset: u64, buf: &[u8]) -> KResult<usize> {
        let _ = (node, offset, buf);
        Err(Errno::EOPNOTSUPP)
    }

    /// Resize `node` to exactly `size` bytes (`truncate`/`ftruncate`).
    fn truncate(&self, node: u64, size: u64) -> KResult<()> {
        let _ = (node, size);
        Err(Errno::EOPNOTSUPP)
    }

    /// List the directory entries of `node` starting at logical `offset`.
    fn readdir(&self, node: u64, offset: usize) -> KResult<Vec<DirEntry>> {
        let _ = (node, offset);
        Err(Errno::EOPNOTSUPP)
    }

    /// `fstat`/`stat`/`lstat`.
    fn getattr(&self, node: u64) -> KResult<Attr> {
        let _ = node;
        Err(Errno::EOPNOTSUPP)
    }

    /// `statfs`.
    fn statfs(&self) -> FsStat {
        FsStat::default()
    }

    /// Flush any buffered state (`fsync`/`sync`). Most in-memory
    /// personalities have nothing to do here.
    fn sync(&self) {}

    /// Called when the last vnode reference to `node` drops
    /// (`VOP_INACTIVE`); lets the personality reclaim storage for unlinked
    /// nodes.
    fn inactive(&self, node: u64) {
        let _ = node;
    }
}

/// Globally unique id for a mounted filesystem.
pub type MountId = u32;

/// One entry in the mount table: a personality rooted at `path`.
pub struct Mount {
    /// This mount's id.
    pub id: MountId,
    /// The path this filesystem is mounted at.
    pub path: String,
    /// The personality vtable.
    pub fs: Arc<dyn Filesystem>,
}

struct MountTable {
    next_id: MountId,
    mounts: Vec<Mount>,
}

static MOUNTS: crate::sync::spinlock::Spinlock<MountTable> =
    crate::sync::spinlock::Spinlock::new(MountTable { next_id: 1, mounts: Vec::new() });

/// Mount `fs` at `path`. Lock order: vnode-cache < mount-list (§5) — callers
/// must not hold a vnode-cache lock when calling this.
pub fn mount(path: &str, fs: Arc<dyn Filesystem>) -> MountId {
    let mut table = MOUNTS.lock();
    let id = table.next_id;
    table.next_id += 1;
    table.mounts.push(Mount { id, path: String::from(path), fs });
    id
}

/// Unmount by id. Returns `false` if no such mount exists.
pub fn umount(id: MountId) -> bool {
    let mut table = MOUNTS.lock();
    let before = table.mounts.len();
    table.mounts.retain(|m| m.id != id);
    table.mounts.len() != before
}

/// Look up a mount by id.
pub fn find_by_id(id: MountId) -> Option<Mount> {
    let table = MOUNTS.lock();
    table.mounts.iter().find(|m| m.id == id).map(|m| Mount { id: m.id, path: m.path.clone(), fs: m.fs.clone() })
}

/// Find the mount whose path is the longest prefix of `path` (§4.7
/// `namei`: "finding its mount (longest matching prefix)").
pub fn find_for_path(path: &str) -> Option<Mount>
where
{
    let table = MOUNTS.lock();
    table
        .mounts
        .iter()
        .filter(|m| path == m.path || path.starts_with(&{
            let mut p = m.path.clone();
            if !p.ends_with('/') {
                p.push('/');
            }
            p
        }) || m.path == "/")
        .max_by_key(|m| m.path.len())
        .map(|m| Mount { id: m.id, path: m.path.clone(), fs: m.fs.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::vnode::VnodeType;

    struct Stub;
    impl Filesystem for Stub {
        fn root(&self) -> u64 {
            0
        }
    }

    fn reset() {
        MOUNTS.lock().mounts.clear();
    }

    #[test]
    fn find_for_path_picks_longest_matching_prefix() {
        reset();
        mount("/", Arc::new(Stub));
        mount("/mnt/data", Arc::new(Stub));
        let found = find_for_path("/mnt/data/file.txt").unwrap();
        assert_eq!(found.path, "/mnt/data");
        let found_root = find_for_path("/etc/passwd").unwrap();
        assert_eq!(found_root.path, "/");
    }

    #[test]
    fn umount_removes_by_id() {
        reset();
        let id = mount("/mnt", Arc::new(Stub));
        assert!(umount(id));
        assert!(!umount(id));
        let _ = VnodeType::Dir;
    }
}
