//! Path-to-vnode resolution (§4.7 `namei`/`lookup`).

use alloc::string::String;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};

use super::cache::{self, VnodeId};
use super::mount;
use super::path;
use super::vnode::VnodeType;

/// Resolve an absolute path to a cached, SHARED-locked vnode.
///
/// Finds the mount with the longest matching path prefix, then walks
/// component by component from that mount's root via `Filesystem::lookup`,
/// re-resolving the owning mount after each step so a path that crosses
/// into a nested mountpoint picks up the nested filesystem (§4.7:
/// "reloading the mount when crossing mountpoints").
pub fn namei(path_str: &str) -> KResult<VnodeId> {
    let normalized = path::normalize(path_str);
    let mut current_path = String::from("/");
    let mount_for = mount::find_for_path(&normalized).ok_or(Errno::ENOENT)?;
    let mut mount_id = mount_for.id;
    let mut fs = mount_for.fs;
    let mut node = fs.root();

    let remainder = normalized.trim_start_matches(&*mount_for.path);
    let components: Vec<&str> = remainder.split('/').filter(|c| !c.is_empty()).collect();

    if components.is_empty() {
        let attr = fs.getattr(node).unwrap_or_default();
        return Ok(cache::vget(mount_id, &current_path, node, VnodeType::Dir, attr.mode, attr.size));
    }

    for (i, comp) in components.iter().enumerate() {
        node = fs.lookup(node, comp).map_err(|_| Errno::ENOENT)?;
        if !current_path.ends_with('/') {
            current_path.push('/');
        }
        current_path.push_str(comp);

        if let Some(nested) = mount::find_for_path(&current_path) {
            if nested.id != mount_id {
                mount_id = nested.id;
                fs = nested.fs;
                node = fs.root();
            }
        }

        let is_last = i == components.len() - 1;
        if is_last {
            let attr = fs.getattr(node).unwrap_or_default();
            let vtype = if attr.mode & 0o40000 != 0 { VnodeType::Dir } else { VnodeType::Reg };
            return Ok(cache::vget(mount_id, &current_path, node, vtype, attr.mode, attr.size));
        }
    }
    unreachable!("loop always returns on the last component")
}

/// Resolve a path to its parent directory's vnode plus the final component
/// name, used by `create`/`unlink`/`rename`/`mkdir`/`rmdir`.
pub fn lookup_parent(path_str: &str) -> KResult<(VnodeId, String)> {
    let normalized = path::normalize(path_str);
    let parent = path::parent(&normalized);
    let name = path::filename(&normalized);
    if name.is_empty() {
        return Err(Errno::EINVAL);
    }
    let dvp = namei(parent)?;
    Ok((dvp, String::from(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;
    use crate::testutil::ensure_platform;
    use crate::vfs::mount::{Attr, DirEntry, Filesystem};
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use alloc::vec;
    use crate::sync::spinlock::Spinlock;

    struct OneFileFs {
        files: Spinlock<BTreeMap<u64, &'static str>>,
    }
    impl Filesystem for OneFileFs {
        fn root(&self) -> u64 {
            0
        }
        fn lookup(&self, dir: u64, name: &str) -> KResult<u64> {
            if dir == 0 && name == "hello.txt" {
                Ok(1)
            } else {
                Err(Errno::ENOENT)
            }
        }
        fn getattr(&self, node: u64) -> KResult<Attr> {
            if node == 0 {
                Ok(Attr { size: 0, mode: 0o40755 })
            } else {
                Ok(Attr { size: self.files.lock().get(&node).map(|s| s.len()).unwrap_or(0) as u64, mode: 0o100644 })
            }
        }
        fn readdir(&self, _node: u64, _offset: usize) -> KResult<Vec<DirEntry>> {
            Ok(vec![])
        }
    }

    fn reset() {
        ensure_platform();
        sched::init();
        crate::vfs::cache::reset_for_test();
    }

    #[test]
    fn namei_resolves_root_and_a_child_file() {
        reset();
        let fs = Arc::new(OneFileFs { files: Spinlock::new(BTreeMap::new()) });
        mount::mount("/", fs);
        let root = namei("/").unwrap();
        assert!(crate::vfs::cache::with_vnode(root, |v| v.vtype).unwrap() == VnodeType::Dir);
        crate::vfs::cache::vput(root);

        let file = namei("/hello.txt").unwrap();
        assert!(crate::vfs::cache::with_vnode(file, |v| v.vtype).unwrap() == VnodeType::Reg);
        crate::vfs::cache::vput(file);
    }

    #[test]
    fn namei_missing_component_is_enoent() {
        reset();
        let fs = Arc::new(OneFileFs { files: Spinlock::new(BTreeMap::new()) });
        mount::mount("/", fs);
        assert_eq!(namei("/nope.txt"), Err(Errno::ENOENT));
    }

    #[test]
    fn lookup_parent_splits_directory_and_name() {
        reset();
        let fs = Arc::new(OneFileFs { files: Spinlock::new(BTreeMap::new()) });
        mount::mount("/", fs);
        let (dvp, name) = lookup_parent("/hello.txt").unwrap();
        assert_eq!(name, "hello.txt");
        crate::vfs::cache::vput(dvp);
    }
}
