//! Character-device filesystem: `/dev/null` and `/dev/zero` (§4.7 "Non-goals"
//! permit a trimmed device set; full block/char driver dispatch lives with
//! an embedder's platform implementation).
//!
//! Trimmed from the teacher's `fs::devfs::DevFs`: the teacher's HAL-backed
//! hardware device proxying (`populate_from_hal`) is out of scope here since
//! this crate has no device driver subsystem of its own, but the "fixed set
//! of named virtual devices dispatching to read/write callbacks" shape
//! carries over directly.

use alloc::string::ToString;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};

use super::mount::{Attr, DirEntry, Filesystem, FsStat};
use super::vnode::VnodeType;

const ROOT: u64 = 0;
const NULL: u64 = 1;
const ZERO: u64 = 2;

/// `/dev`: just `null` and `zero`, each a fixed node id.
pub struct DevFs;

impl DevFs {
    pub fn new() -> Self {
        DevFs
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for DevFs {
    fn root(&self) -> u64 {
        ROOT
    }

    fn lookup(&self, dir: u64, name: &str) -> KResult<u64> {
        if dir != ROOT {
            return Err(Errno::ENOTDIR);
        }
        match name {
            "null" => Ok(NULL),
            "zero" => Ok(ZERO),
            _ => Err(Errno::ENOENT),
        }
    }

    fn read(&self, node: u64, _offset: u64, buf: &mut [u8]) -> KResult<usize> {
        match node {
            NULL => Ok(0),
            ZERO => {
                buf.fill(0);
                Ok(buf.len())
            }
            _ => Err(Errno::ENOENT),
        }
    }

    fn write(&self, node: u64, _offset: u64, buf: &[u8]) -> KResult<usize> {
        match node {
            NULL | ZERO => Ok(buf.len()),
            _ => Err(Errno::ENOENT),
        }
    }

    fn readdir(&self, node: u64, offset: usize) -> KResult<Vec<DirEntry>> {
        if node != ROOT {
            return Err(Errno::ENOTDIR);
        }
        let all = [
            DirEntry { name: "null".to_string(), node: NULL, vtype: VnodeType::Chr },
            DirEntry { name: "zero".to_string(), node: ZERO, vtype: VnodeType::Chr },
        ];
        Ok(all.into_iter().skip(offset).collect())
    }

    fn getattr(&self, node: u64) -> KResult<Attr> {
        match node {
            ROOT => Ok(Attr { size: 0, mode: 0o40755 }),
            NULL | ZERO => Ok(Attr { size: 0, mode: 0o20666 }),
            _ => Err(Errno::ENOENT),
        }
    }

    fn statfs(&self) -> FsStat {
        FsStat::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_read_is_eof_and_write_discards() {
        let fs = DevFs::new();
        let null = fs.lookup(ROOT, "null").unwrap();
        let mut buf = [0xffu8; 4];
        assert_eq!(fs.read(null, 0, &mut buf).unwrap(), 0);
        assert_eq!(fs.write(null, 0, b"xyz").unwrap(), 3);
    }

    #[test]
    fn zero_read_fills_buffer_with_zero_bytes() {
        let fs = DevFs::new();
        let zero = fs.lookup(ROOT, "zero").unwrap();
        let mut buf = [0xffu8; 4];
        assert_eq!(fs.read(zero, 0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn readdir_lists_both_devices() {
        let fs = DevFs::new();
        let entries = fs.readdir(ROOT, 0).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
