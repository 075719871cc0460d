//! Open-file-description table and fd-level operations (§4.7).
//!
//! Grounded on the teacher's `fs::file::OpenFile` (fields renamed to work
//! against a vnode rather than a raw FAT cluster/inode pair) and the
//! teacher's `fs::vfs` dispatcher for the "resolve fd, take the vnode lock,
//! dispatch to the vtable, release the lock" flow.

use alloc::string::String;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};
use crate::sched;

use super::cache::{self, VnodeId};
use super::fd_table::FdKind;
use super::mount::{self, DirEntry};
use super::namei;
use super::path;
use super::vnode::VnodeType;

/// Flags from `open(2)`'s `oflag` argument that matter to this layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub directory: bool,
    pub cloexec: bool,
}

/// Where `lseek`'s offset is measured from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// An open-file description: shared across `dup`/`fork`, owns the current
/// file offset and the open mode, refcounted so the last fd pointing at it
/// releases the underlying vnode.
pub struct OpenFile {
    pub vnode: VnodeId,
    pub flags: OpenFlags,
    pub position: u64,
    refcount: u32,
}

struct Table {
    arena: Vec<Option<OpenFile>>,
    free: Vec<u32>,
}

static TABLE: crate::sync::spinlock::Spinlock<Table> =
    crate::sync::spinlock::Spinlock::new(Table { arena: Vec::new(), free: Vec::new() });

#[cfg(test)]
pub(crate) fn reset_for_test() {
    let mut t = TABLE.lock();
    t.arena.clear();
    t.free.clear();
}

fn alloc_ofd(vnode: VnodeId, flags: OpenFlags, position: u64) -> u32 {
    let mut t = TABLE.lock();
    let ofd = OpenFile { vnode, flags, position, refcount: 1 };
    match t.free.pop() {
        Some(slot) => {
            t.arena[slot as usize] = Some(ofd);
            slot
        }
        None => {
            let slot = t.arena.len() as u32;
            t.arena.push(Some(ofd));
            slot
        }
    }
}

fn incref_ofd(id: u32) {
    let mut t = TABLE.lock();
    if let Some(ofd) = t.arena.get_mut(id as usize).and_then(|o| o.as_mut()) {
        ofd.refcount += 1;
    }
}

/// Drop one reference to an open-file description, releasing its vnode and
/// freeing the slot once the last fd pointing at it closes.
fn decref_ofd(id: u32) {
    let vnode = {
        let mut t = TABLE.lock();
        match t.arena.get_mut(id as usize).and_then(|o| o.as_mut()) {
            Some(ofd) => {
                ofd.refcount -= 1;
                if ofd.refcount == 0 {
                    let v = ofd.vnode;
                    t.arena[id as usize] = None;
                    t.free.push(id);
                    Some(v)
                } else {
                    None
                }
            }
            None => None,
        }
    };
    if let Some(v) = vnode {
        cache::vput(v);
    }
}

fn with_ofd<R>(id: u32, f: impl FnOnce(&OpenFile) -> R) -> Option<R> {
    let t = TABLE.lock();
    t.arena.get(id as usize)?.as_ref().map(f)
}

fn with_ofd_mut<R>(id: u32, f: impl FnOnce(&mut OpenFile) -> R) -> Option<R> {
    let mut t = TABLE.lock();
    t.arena.get_mut(id as usize)?.as_mut().map(f)
}

fn resolve_path(raw: &str) -> String {
    let cwd = sched::current_cwd();
    path::resolve_relative(&cwd, raw)
}

/// `open(2)`: resolve `raw_path`, optionally creating it, and install a new
/// fd in the calling thread's table.
pub fn open(raw_path: &str, flags: OpenFlags, mode: u32) -> KResult<u32> {
    let resolved = resolve_path(raw_path);
    // `namei`/`vget` hand back a vnode SHARED-locked for the duration of the
    // lookup; an open-file description only needs the reference, not a
    // standing lock, so each arm below releases it before returning.
    let vnode = match namei::namei(&resolved) {
        Ok(v) => {
            if flags.create && flags.truncate {
                cache::lock_rw_upgrade(v);
                let result = cache::with_vnode(v, |vn| (vn.mount, vn.fs_node)).unwrap();
                if let Some(m) = mount::find_by_id(result.0) {
                    m.fs.truncate(result.1, 0)?;
                }
                cache::unlock(v);
            } else {
                cache::unlock(v);
            }
            v
        }
        Err(Errno::ENOENT) if flags.create => {
            let (dvp, name) = namei::lookup_parent(&resolved)?;
            let (mount_id, dir_node) = cache::with_vnode(dvp, |vn| (vn.mount, vn.fs_node)).unwrap();
            let created = match mount::find_by_id(mount_id) {
                Some(m) => {
                    let node = m.fs.create(dir_node, &name, mode)?;
                    cache::vput(dvp);
                    let v = cache::vget(mount_id, &resolved, node, VnodeType::Reg, mode, 0);
                    cache::unlock(v);
                    v
                }
                None => {
                    cache::vput(dvp);
                    return Err(Errno::ENOENT);
                }
            };
            created
        }
        Err(e) => return Err(e),
    };

    let position = if flags.append {
        cache::with_vnode(vnode, |vn| vn.size).unwrap_or(0)
    } else {
        0
    };
    let ofd_id = alloc_ofd(vnode, flags, position);
    sched::with_current_thread(|t| t.fd_table.alloc(FdKind::File { ofd_id })).ok_or_else(|| {
        decref_ofd(ofd_id);
        Errno::EMFILE
    })
}

fn lookup_fd(fd: u32) -> KResult<u32> {
    sched::with_current_thread(|t| match t.fd_table.get(fd) {
        Some(entry) => match entry.kind {
            FdKind::File { ofd_id } => Ok(ofd_id),
            _ => Err(Errno::EBADF),
        },
        None => Err(Errno::EBADF),
    })
}

/// `read(2)`.
pub fn read(fd: u32, buf: &mut [u8]) -> KResult<usize> {
    let ofd_id = lookup_fd(fd)?;
    let (vnode, offset) = with_ofd(ofd_id, |o| (o.vnode, o.position)).ok_or(Errno::EBADF)?;
    cache::lock_shared(vnode);
    let result = cache::with_vnode(vnode, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF);
    let n = result.and_then(|(mount_id, node)| {
        mount::find_by_id(mount_id).ok_or(Errno::ENOENT).and_then(|m| m.fs.read(node, offset, buf))
    });
    cache::unlock(vnode);
    let n = n?;
    with_ofd_mut(ofd_id, |o| o.position += n as u64);
    Ok(n)
}

/// `write(2)`.
pub fn write(fd: u32, buf: &[u8]) -> KResult<usize> {
    let ofd_id = lookup_fd(fd)?;
    let (vnode, flags, mut offset) =
        with_ofd(ofd_id, |o| (o.vnode, o.flags, o.position)).ok_or(Errno::EBADF)?;
    if !flags.write {
        return Err(Errno::EBADF);
    }
    cache::lock_exclusive(vnode);
    if flags.append {
        offset = cache::with_vnode(vnode, |vn| vn.size).unwrap_or(offset);
    }
    let result = cache::with_vnode(vnode, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF);
    let n = result.and_then(|(mount_id, node)| {
        mount::find_by_id(mount_id).ok_or(Errno::ENOENT).and_then(|m| m.fs.write(node, offset, buf))
    });
    if let Ok(written) = n {
        let new_size = offset + written as u64;
        cache::with_vnode_mut(vnode, |vn| vn.size = vn.size.max(new_size));
    }
    cache::unlock(vnode);
    let n = n?;
    with_ofd_mut(ofd_id, |o| o.position = offset + n as u64);
    Ok(n)
}

/// `lseek(2)`.
pub fn lseek(fd: u32, whence: SeekFrom) -> KResult<u64> {
    let ofd_id = lookup_fd(fd)?;
    let (vnode, position) = with_ofd(ofd_id, |o| (o.vnode, o.position)).ok_or(Errno::EBADF)?;
    let size = cache::with_vnode(vnode, |vn| vn.size).unwrap_or(0);
    let new_pos = match whence {
        SeekFrom::Start(off) => off,
        SeekFrom::Current(delta) => (position as i64 + delta).max(0) as u64,
        SeekFrom::End(delta) => (size as i64 + delta).max(0) as u64,
    };
    with_ofd_mut(ofd_id, |o| o.position = new_pos);
    Ok(new_pos)
}

/// `readdir`-style directory listing for a directory fd.
pub fn readdir(fd: u32, offset: usize) -> KResult<Vec<DirEntry>> {
    let ofd_id = lookup_fd(fd)?;
    let vnode = with_ofd(ofd_id, |o| o.vnode).ok_or(Errno::EBADF)?;
    cache::lock_shared(vnode);
    let result = cache::with_vnode(vnode, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF);
    let entries = result.and_then(|(mount_id, node)| {
        mount::find_by_id(mount_id).ok_or(Errno::ENOENT).and_then(|m| m.fs.readdir(node, offset))
    });
    cache::unlock(vnode);
    entries
}

/// `close(2)`.
pub fn close(fd: u32) -> KResult<()> {
    let kind = sched::with_current_thread(|t| t.fd_table.close(fd)).ok_or(Errno::EBADF)?;
    if let FdKind::File { ofd_id } = kind {
        decref_ofd(ofd_id);
    }
    Ok(())
}

/// `dup(2)`: allocate a new fd sharing the same open-file description.
pub fn dup(fd: u32) -> KResult<u32> {
    let ofd_id = lookup_fd(fd)?;
    incref_ofd(ofd_id);
    sched::with_current_thread(|t| t.fd_table.alloc(FdKind::File { ofd_id })).ok_or_else(|| {
        decref_ofd(ofd_id);
        Errno::EMFILE
    })
}

/// `dup2(2)`: point `new_fd` at the same open-file description as `old_fd`.
pub fn dup2(old_fd: u32, new_fd: u32) -> KResult<u32> {
    if old_fd == new_fd {
        lookup_fd(old_fd)?;
        return Ok(new_fd);
    }
    let ofd_id = lookup_fd(old_fd)?;
    let _ = close(new_fd);
    incref_ofd(ofd_id);
    let ok = sched::with_current_thread(|t| t.fd_table.alloc_at(new_fd, FdKind::File { ofd_id }));
    if !ok {
        decref_ofd(ofd_id);
        return Err(Errno::EBADF);
    }
    Ok(new_fd)
}

/// `fstat`/`stat`/`lstat` on an already-open fd.
pub fn fstat(fd: u32) -> KResult<mount::Attr> {
    let ofd_id = lookup_fd(fd)?;
    let vnode = with_ofd(ofd_id, |o| o.vnode).ok_or(Errno::EBADF)?;
    let (mount_id, node) = cache::with_vnode(vnode, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF)?;
    mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.getattr(node)
}

/// `fsync(2)`: flush the fd's filesystem (§6 "fsync").
pub fn fsync(fd: u32) -> KResult<()> {
    let ofd_id = lookup_fd(fd)?;
    let vnode = with_ofd(ofd_id, |o| o.vnode).ok_or(Errno::EBADF)?;
    let mount_id = cache::with_vnode(vnode, |vn| vn.mount).ok_or(Errno::EBADF)?;
    mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.sync();
    Ok(())
}

/// `ftruncate(2)` on an already-open fd.
pub fn ftruncate(fd: u32, size: u64) -> KResult<()> {
    let ofd_id = lookup_fd(fd)?;
    let vnode = with_ofd(ofd_id, |o| o.vnode).ok_or(Errno::EBADF)?;
    cache::lock_rw_upgrade(vnode);
    let result = cache::with_vnode(vnode, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF);
    let r = result.and_then(|(mount_id, node)| {
        mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.truncate(node, size)
    });
    if r.is_ok() {
        cache::with_vnode_mut(vnode, |vn| vn.size = size);
    }
    cache::unlock(vnode);
    r
}

/// `stat(2)`/`lstat(2)`: resolve `raw_path` and return its attributes
/// without requiring an open fd.
pub fn stat(raw_path: &str) -> KResult<mount::Attr> {
    let resolved = resolve_path(raw_path);
    let vnode = namei::namei(&resolved)?;
    let attr = cache::with_vnode(vnode, |vn| (vn.mount, vn.fs_node))
        .ok_or(Errno::ENOENT)
        .and_then(|(mount_id, node)| mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.getattr(node));
    cache::vput(vnode);
    attr
}

/// `mkdir(2)`.
pub fn mkdir(raw_path: &str, mode: u32) -> KResult<()> {
    let resolved = resolve_path(raw_path);
    let (dvp, name) = namei::lookup_parent(&resolved)?;
    let (mount_id, dir_node) = cache::with_vnode(dvp, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF)?;
    let r = mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.mkdir(dir_node, &name, mode).map(|_| ());
    cache::vput(dvp);
    r
}

/// `rmdir(2)`.
pub fn rmdir(raw_path: &str) -> KResult<()> {
    let resolved = resolve_path(raw_path);
    let (dvp, name) = namei::lookup_parent(&resolved)?;
    let (mount_id, dir_node) = cache::with_vnode(dvp, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF)?;
    let r = mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.rmdir(dir_node, &name);
    cache::vput(dvp);
    r
}

/// `unlink(2)`.
pub fn unlink(raw_path: &str) -> KResult<()> {
    let resolved = resolve_path(raw_path);
    let (dvp, name) = namei::lookup_parent(&resolved)?;
    let (mount_id, dir_node) = cache::with_vnode(dvp, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF)?;
    let r = mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.remove(dir_node, &name);
    cache::vput(dvp);
    r
}

/// `rename(2)`. Cross-mount renames are not supported (`EXDEV`), matching
/// the spec's VFS Non-goal of on-disk format concerns — a rename that
/// crosses a mount boundary would need to copy, which this layer leaves to
/// a caller that wants that behaviour explicitly.
pub fn rename(old_raw: &str, new_raw: &str) -> KResult<()> {
    let old_resolved = resolve_path(old_raw);
    let new_resolved = resolve_path(new_raw);
    let (old_dvp, old_name) = namei::lookup_parent(&old_resolved)?;
    let (new_dvp, new_name) = namei::lookup_parent(&new_resolved)?;
    let (old_mount, old_dir) = cache::with_vnode(old_dvp, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF)?;
    let (new_mount, new_dir) = cache::with_vnode(new_dvp, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF)?;
    let r = if old_mount != new_mount {
        Err(Errno::EXDEV)
    } else {
        mount::find_by_id(old_mount).ok_or(Errno::ENOENT)?.fs.rename(old_dir, &old_name, new_dir, &new_name)
    };
    cache::vput(old_dvp);
    cache::vput(new_dvp);
    r
}

/// `link(2)`: hard links are not modeled by [`mount::Filesystem`] (every
/// personality in this crate keys a node by one name); unsupported.
pub fn link(_old_raw: &str, _new_raw: &str) -> KResult<()> {
    Err(Errno::EOPNOTSUPP)
}

/// `access(2)`: resolve the path and report whether it exists. Permission
/// bits beyond existence are not modeled (no credential check in this
/// layer; see §1 Non-goals).
pub fn access(raw_path: &str) -> KResult<()> {
    let resolved = resolve_path(raw_path);
    let vnode = namei::namei(&resolved)?;
    cache::vput(vnode);
    Ok(())
}

/// `truncate(2)` on a path rather than an open fd.
pub fn truncate(raw_path: &str, size: u64) -> KResult<()> {
    let resolved = resolve_path(raw_path);
    let vnode = namei::namei(&resolved)?;
    cache::lock_rw_upgrade(vnode);
    let result = cache::with_vnode(vnode, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF);
    let r = result.and_then(|(mount_id, node)| {
        mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.truncate(node, size)
    });
    if r.is_ok() {
        cache::with_vnode_mut(vnode, |vn| vn.size = size);
    }
    cache::vput(vnode);
    r
}

/// `chdir(2)`: resolve `raw_path`, require it to be a directory, and set it
/// as the calling thread's cwd.
pub fn chdir(raw_path: &str) -> KResult<()> {
    let resolved = resolve_path(raw_path);
    let vnode = namei::namei(&resolved)?;
    let is_dir = cache::with_vnode(vnode, |vn| vn.vtype == VnodeType::Dir).unwrap_or(false);
    if !is_dir {
        cache::vput(vnode);
        return Err(Errno::ENOTDIR);
    }
    cache::vput(vnode);
    sched::with_current_thread(|t| t.cwd = resolved);
    Ok(())
}

/// `fchdir(2)`: like [`chdir`] but the target directory is already open on
/// `fd`.
pub fn fchdir(fd: u32) -> KResult<()> {
    let ofd_id = lookup_fd(fd)?;
    let vnode = with_ofd(ofd_id, |o| o.vnode).ok_or(Errno::EBADF)?;
    let is_dir = cache::with_vnode(vnode, |vn| vn.vtype == VnodeType::Dir).unwrap_or(false);
    if !is_dir {
        return Err(Errno::ENOTDIR);
    }
    let path = cache::with_vnode(vnode, |vn| vn.path.clone()).unwrap_or_else(|| String::from("/"));
    sched::with_current_thread(|t| t.cwd = path);
    Ok(())
}

/// `getcwd(2)`.
pub fn getcwd() -> String {
    sched::current_cwd()
}

/// `mknod(2)`: device-node creation is a devfs concept, not a generic
/// [`mount::Filesystem`] operation — routed through `mkdir`'s create path
/// is wrong (wrong type), so this surfaces as a regular-file `create` when
/// mode requests a regular file and `EOPNOTSUPP` otherwise; a devfs-aware
/// embedder registers its own device nodes directly with `devfs` instead of
/// through this generic path.
pub fn mknod(raw_path: &str, mode: u32) -> KResult<()> {
    if mode & 0o170000 != 0o100000 {
        return Err(Errno::EOPNOTSUPP);
    }
    let resolved = resolve_path(raw_path);
    let (dvp, name) = namei::lookup_parent(&resolved)?;
    let (mount_id, dir_node) = cache::with_vnode(dvp, |vn| (vn.mount, vn.fs_node)).ok_or(Errno::EBADF)?;
    let r = mount::find_by_id(mount_id).ok_or(Errno::ENOENT)?.fs.create(dir_node, &name, mode).map(|_| ());
    cache::vput(dvp);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;
    use crate::testutil::ensure_platform;
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use alloc::vec;

    struct MemFs {
        files: crate::sync::spinlock::Spinlock<BTreeMap<u64, Vec<u8>>>,
        next_node: crate::sync::spinlock::Spinlock<u64>,
    }

    impl MemFs {
        fn new() -> Self {
            let mut files = BTreeMap::new();
            files.insert(0, Vec::new());
            MemFs {
                files: crate::sync::spinlock::Spinlock::new(files),
                next_node: crate::sync::spinlock::Spinlock::new(1),
            }
        }
    }

    impl mount::Filesystem for MemFs {
        fn root(&self) -> u64 {
            0
        }
        fn create(&self, _dir: u64, _name: &str, _mode: u32) -> KResult<u64> {
            let mut next = self.next_node.lock();
            let node = *next;
            *next += 1;
            self.files.lock().insert(node, Vec::new());
            Ok(node)
        }
        fn read(&self, node: u64, offset: u64, buf: &mut [u8]) -> KResult<usize> {
            let files = self.files.lock();
            let data = files.get(&node).ok_or(Errno::ENOENT)?;
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }
        fn write(&self, node: u64, offset: u64, buf: &[u8]) -> KResult<usize> {
            let mut files = self.files.lock();
            let data = files.get_mut(&node).ok_or(Errno::ENOENT)?;
            let offset = offset as usize;
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
        fn getattr(&self, node: u64) -> KResult<mount::Attr> {
            if node == 0 {
                return Ok(mount::Attr { size: 0, mode: 0o40755 });
            }
            let files = self.files.lock();
            let size = files.get(&node).map(|d| d.len()).unwrap_or(0) as u64;
            Ok(mount::Attr { size, mode: 0o100644 })
        }
        fn readdir(&self, _node: u64, _offset: usize) -> KResult<Vec<DirEntry>> {
            Ok(vec![])
        }
    }

    fn reset() {
        ensure_platform();
        sched::init();
        cache::reset_for_test();
        reset_for_test();
        mount::mount("/", Arc::new(MemFs::new()));
    }

    fn create_flags() -> OpenFlags {
        OpenFlags { create: true, write: true, read: true, ..Default::default() }
    }

    #[test]
    fn open_create_write_read_round_trips() {
        reset();
        let fd = open("/a.txt", create_flags(), 0o644).unwrap();
        assert_eq!(write(fd, b"hello").unwrap(), 5);
        lseek(fd, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        close(fd).unwrap();
    }

    #[test]
    fn dup2_shares_offset_via_shared_description() {
        reset();
        let fd = open("/b.txt", create_flags(), 0o644).unwrap();
        write(fd, b"abcdef").unwrap();
        lseek(fd, SeekFrom::Start(0)).unwrap();
        let fd2 = dup2(fd, 50).unwrap();
        let mut buf = [0u8; 3];
        read(fd2, &mut buf).unwrap();
        let mut rest = [0u8; 3];
        assert_eq!(read(fd, &mut rest).unwrap(), 3);
        assert_eq!(&rest, b"def");
        close(fd).unwrap();
        close(fd2).unwrap();
    }

    #[test]
    fn close_on_unknown_fd_is_ebadf() {
        reset();
        assert_eq!(close(99), Err(Errno::EBADF));
    }
}
