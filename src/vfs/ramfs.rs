//! In-memory reference filesystem personality (§4.7 "Reference filesystem
//! personality (added)"), exercising the full [`super::mount::Filesystem`]
//! vtable end to end for tests and an embedder that just needs a root to
//! mount devfs under.
//!
//! Grounded on the teacher's `fs::devfs::DevFs` for the "one `Spinlock`-
//! guarded table of nodes, name-indexed lookup" shape, generalized from a
//! flat device list to a full tree of files and directories.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};
use crate::sync::spinlock::Spinlock;

use super::mount::{Attr, DirEntry, Filesystem, FsStat};
use super::vnode::VnodeType;

enum NodeBody {
    File(Vec<u8>),
    Dir(BTreeMap<String, u64>),
}

struct Node {
    body: NodeBody,
    mode: u32,
}

struct Inner {
    nodes: BTreeMap<u64, Node>,
    next_id: u64,
}

/// A mountable in-memory filesystem: files are `Vec<u8>`, directories are
/// name-to-node maps.
pub struct RamFs {
    inner: Spinlock<Inner>,
}

impl RamFs {
    /// A fresh filesystem with just an empty root directory (node 0).
    pub fn new() -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert(0, Node { body: NodeBody::Dir(BTreeMap::new()), mode: 0o40755 });
        Arc::new(RamFs { inner: Spinlock::new(Inner { nodes, next_id: 1 }) })
    }

    fn alloc_node(&self, inner: &mut Inner, body: NodeBody, mode: u32) -> u64 {
        let id = inner.next_id;
        inner.next_id += 1;
        inner.nodes.insert(id, Node { body, mode });
        id
    }
}

impl Default for RamFs {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(0, Node { body: NodeBody::Dir(BTreeMap::new()), mode: 0o40755 });
        RamFs { inner: Spinlock::new(Inner { nodes, next_id: 1 }) }
    }
}

impl Filesystem for RamFs {
    fn root(&self) -> u64 {
        0
    }

    fn lookup(&self, dir: u64, name: &str) -> KResult<u64> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(&dir).ok_or(Errno::ENOENT)?;
        match &node.body {
            NodeBody::Dir(entries) => entries.get(name).copied().ok_or(Errno::ENOENT),
            NodeBody::File(_) => Err(Errno::ENOTDIR),
        }
    }

    fn create(&self, dir: u64, name: &str, mode: u32) -> KResult<u64> {
        let mut inner = self.inner.lock();
        if !matches!(inner.nodes.get(&dir).map(|n| &n.body), Some(NodeBody::Dir(_))) {
            return Err(Errno::ENOTDIR);
        }
        if let Some(NodeBody::Dir(entries)) = inner.nodes.get(&dir).map(|n| &n.body) {
            if entries.contains_key(name) {
                return Err(Errno::EEXIST);
            }
        }
        let id = self.alloc_node(&mut inner, NodeBody::File(Vec::new()), mode);
        if let Some(Node { body: NodeBody::Dir(entries), .. }) = inner.nodes.get_mut(&dir) {
            entries.insert(name.to_string(), id);
        }
        Ok(id)
    }

    fn mkdir(&self, dir: u64, name: &str, mode: u32) -> KResult<u64> {
        let mut inner = self.inner.lock();
        match inner.nodes.get(&dir).map(|n| &n.body) {
            Some(NodeBody::Dir(entries)) if entries.contains_key(name) => return Err(Errno::EEXIST),
            Some(NodeBody::Dir(_)) => {}
            Some(NodeBody::File(_)) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::ENOENT),
        }
        let id = self.alloc_node(&mut inner, NodeBody::Dir(BTreeMap::new()), mode | 0o40000);
        if let Some(Node { body: NodeBody::Dir(entries), .. }) = inner.nodes.get_mut(&dir) {
            entries.insert(name.to_string(), id);
        }
        Ok(id)
    }

    fn remove(&self, dir: u64, name: &str) -> KResult<()> {
        let mut inner = self.inner.lock();
        let target = match inner.nodes.get(&dir).map(|n| &n.body) {
            Some(NodeBody::Dir(entries)) => *entries.get(name).ok_or(Errno::ENOENT)?,
            Some(NodeBody::File(_)) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::ENOENT),
        };
        if matches!(inner.nodes.get(&target).map(|n| &n.body), Some(NodeBody::Dir(_))) {
            return Err(Errno::EISDIR);
        }
        if let Some(Node { body: NodeBody::Dir(entries), .. }) = inner.nodes.get_mut(&dir) {
            entries.remove(name);
        }
        inner.nodes.remove(&target);
        Ok(())
    }

    fn rmdir(&self, dir: u64, name: &str) -> KResult<()> {
        let mut inner = self.inner.lock();
        let target = match inner.nodes.get(&dir).map(|n| &n.body) {
            Some(NodeBody::Dir(entries)) => *entries.get(name).ok_or(Errno::ENOENT)?,
            Some(NodeBody::File(_)) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::ENOENT),
        };
        match inner.nodes.get(&target).map(|n| &n.body) {
            Some(NodeBody::Dir(entries)) if !entries.is_empty() => return Err(Errno::ENOTEMPTY),
            Some(NodeBody::Dir(_)) => {}
            _ => return Err(Errno::ENOTDIR),
        }
        if let Some(Node { body: NodeBody::Dir(entries), .. }) = inner.nodes.get_mut(&dir) {
            entries.remove(name);
        }
        inner.nodes.remove(&target);
        Ok(())
    }

    fn rename(&self, old_dir: u64, old_name: &str, new_dir: u64, new_name: &str) -> KResult<()> {
        let mut inner = self.inner.lock();
        let target = match inner.nodes.get(&old_dir).map(|n| &n.body) {
            Some(NodeBody::Dir(entries)) => *entries.get(old_name).ok_or(Errno::ENOENT)?,
            _ => return Err(Errno::ENOTDIR),
        };
        if !matches!(inner.nodes.get(&new_dir).map(|n| &n.body), Some(NodeBody::Dir(_))) {
            return Err(Errno::ENOTDIR);
        }
        if let Some(Node { body: NodeBody::Dir(entries), .. }) = inner.nodes.get_mut(&old_dir) {
            entries.remove(old_name);
        }
        if let Some(Node { body: NodeBody::Dir(entries), .. }) = inner.nodes.get_mut(&new_dir) {
            entries.insert(new_name.to_string(), target);
        }
        Ok(())
    }

    fn read(&self, node: u64, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let inner = self.inner.lock();
        match inner.nodes.get(&node).map(|n| &n.body) {
            Some(NodeBody::File(data)) => {
                let offset = offset as usize;
                if offset >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - offset);
                buf[..n].copy_from_slice(&data[offset..offset + n]);
                Ok(n)
            }
            Some(NodeBody::Dir(_)) => Err(Errno::EISDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn write(&self, node: u64, offset: u64, buf: &[u8]) -> KResult<usize> {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(&node).map(|n| &mut n.body) {
            Some(NodeBody::File(data)) => {
                let offset = offset as usize;
                if data.len() < offset + buf.len() {
                    data.resize(offset + buf.len(), 0);
                }
                data[offset..offset + buf.len()].copy_from_slice(buf);
                Ok(buf.len())
            }
            Some(NodeBody::Dir(_)) => Err(Errno::EISDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn truncate(&self, node: u64, size: u64) -> KResult<()> {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(&node).map(|n| &mut n.body) {
            Some(NodeBody::File(data)) => {
                data.resize(size as usize, 0);
                Ok(())
            }
            Some(NodeBody::Dir(_)) => Err(Errno::EISDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn readdir(&self, node: u64, offset: usize) -> KResult<Vec<DirEntry>> {
        let inner = self.inner.lock();
        match inner.nodes.get(&node).map(|n| &n.body) {
            Some(NodeBody::Dir(entries)) => Ok(entries
                .iter()
                .skip(offset)
                .map(|(name, &child)| {
                    let vtype = match inner.nodes.get(&child).map(|n| &n.body) {
                        Some(NodeBody::Dir(_)) => VnodeType::Dir,
                        _ => VnodeType::Reg,
                    };
                    DirEntry { name: name.clone(), node: child, vtype }
                })
                .collect()),
            Some(NodeBody::File(_)) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn getattr(&self, node: u64) -> KResult<Attr> {
        let inner = self.inner.lock();
        let n = inner.nodes.get(&node).ok_or(Errno::ENOENT)?;
        let size = match &n.body {
            NodeBody::File(data) => data.len() as u64,
            NodeBody::Dir(_) => 0,
        };
        Ok(Attr { size, mode: n.mode })
    }

    fn statfs(&self) -> FsStat {
        let inner = self.inner.lock();
        FsStat { blocks: u64::MAX, free_blocks: u64::MAX - inner.nodes.len() as u64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_and_readdir_round_trip() {
        let fs = RamFs::new();
        let file = fs.create(0, "a.txt", 0o644).unwrap();
        assert_eq!(fs.write(file, 0, b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(file, 0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
        let entries = fs.readdir(0, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }

    #[test]
    fn mkdir_then_rmdir_requires_empty() {
        let fs = RamFs::new();
        let dir = fs.mkdir(0, "sub", 0o755).unwrap();
        fs.create(dir, "f", 0o644).unwrap();
        assert_eq!(fs.rmdir(0, "sub"), Err(Errno::ENOTEMPTY));
        fs.remove(dir, "f").unwrap();
        assert!(fs.rmdir(0, "sub").is_ok());
    }

    #[test]
    fn rename_moves_entry_between_directories() {
        let fs = RamFs::new();
        let dir = fs.mkdir(0, "sub", 0o755).unwrap();
        fs.create(0, "f.txt", 0o644).unwrap();
        fs.rename(0, "f.txt", dir, "g.txt").unwrap();
        assert_eq!(fs.lookup(0, "f.txt"), Err(Errno::ENOENT));
        assert!(fs.lookup(dir, "g.txt").is_ok());
    }
}
