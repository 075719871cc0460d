//! Memory-management syscall handlers (§4.3, §6 "Memory").
//!
//! Grounded on the teacher's `syscall::handlers::process::{sys_sbrk,
//! sys_mmap}`: fixed heap/mmap regions, bump-style growth, zeroed backing
//! pages. `mmap`/`munmap`/`mprotect` are thin wrappers over
//! [`crate::mm::vm::{allocate, free, attribute}`], which already implement
//! exactly this kernel's version of that behavior (§4.3 "Allocate"/"Free"/
//! "Attribute"); there is nothing `mmap`-specific left for this layer to do
//! beyond unpacking flags. `mremap` has no vm.rs primitive of its own: it is
//! built here as allocate-new + copy + free-old, legitimate because a
//! syscall in this design always runs with the calling process's address
//! space already active (§4.8).

use crate::errno::{Errno, KResult};
use crate::mm::address::VirtAddr;
use crate::mm::vm;
use crate::sched;

use super::table::set_syscall;

pub const SYS_BRK: usize = 40;
pub const SYS_MMAP: usize = 41;
pub const SYS_MMAP2: usize = 42;
pub const SYS_MUNMAP: usize = 43;
pub const SYS_MPROTECT: usize = 44;
pub const SYS_MREMAP: usize = 45;

/// `mmap` protection bits, matching the POSIX `PROT_*` values this
/// surface's callers already compile against.
const PROT_WRITE: u64 = 0x2;
const PROT_EXEC: u64 = 0x4;

/// `mmap` MAP_FIXED: place the mapping at exactly the requested address
/// instead of letting the allocator choose.
const MAP_FIXED: u64 = 0x10;

pub(crate) fn install() {
    set_syscall(SYS_BRK, sys_brk);
    set_syscall(SYS_MMAP, sys_mmap);
    set_syscall(SYS_MMAP2, sys_mmap);
    set_syscall(SYS_MUNMAP, sys_munmap);
    set_syscall(SYS_MPROTECT, sys_mprotect);
    set_syscall(SYS_MREMAP, sys_mremap);
}

fn current_map() -> KResult<vm::MapId> {
    sched::with_current_thread(|t| t.vm_map).ok_or(Errno::EINVAL)
}

/// `brk(addr)`: move the break to `addr` (0 just queries the current
/// break), returning the break in effect afterward, the same
/// query-by-zero-argument convention as the teacher's `sys_sbrk`.
fn sys_brk(args: &[u64; 6]) -> KResult<i64> {
    let map = current_map()?;
    let requested = args[0];
    let top = if requested == 0 {
        vm::brk_current(map)?
    } else {
        vm::brk_set(map, VirtAddr(requested))?
    };
    Ok(top.0 as i64)
}

/// `mmap(addr, len, prot, flags, fd, offset)`. Only anonymous mappings are
/// implemented (file-backed mmap needs a page-cache this kernel doesn't
/// have); `fd`/`offset` are accepted and ignored the way the teacher's
/// `sys_mmap` ignores them for its own anonymous-only implementation.
fn sys_mmap(args: &[u64; 6]) -> KResult<i64> {
    let addr = args[0];
    let len = args[1];
    let prot = args[2];
    let flags = args[3];
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let map = current_map()?;
    let hint = if addr != 0 || flags & MAP_FIXED != 0 { Some(VirtAddr(addr)) } else { None };
    let target = vm::allocate(map, hint, len)?;
    let writable = prot & PROT_WRITE != 0;
    let exec = prot & PROT_EXEC != 0;
    if writable || exec {
        vm::attribute(map, target, len, writable, exec)?;
    }
    Ok(target.0 as i64)
}

fn sys_munmap(args: &[u64; 6]) -> KResult<i64> {
    let map = current_map()?;
    vm::free(map, VirtAddr(args[0]), args[1])?;
    Ok(0)
}

fn sys_mprotect(args: &[u64; 6]) -> KResult<i64> {
    let map = current_map()?;
    let prot = args[2];
    vm::attribute(map, VirtAddr(args[0]), args[1], prot & PROT_WRITE != 0, prot & PROT_EXEC != 0)?;
    Ok(0)
}

/// `mremap(old_addr, old_size, new_size)`: allocate `new_size` bytes
/// anywhere, copy `min(old_size, new_size)` bytes from the old mapping, free
/// the old mapping, and return the new address. No in-place growth: this
/// kernel's segment arena has no "extend if the next segment happens to be
/// free" path, so every `mremap` relocates, which is always a legal
/// `mremap` outcome for a caller that didn't pass `MREMAP_FIXED`.
fn sys_mremap(args: &[u64; 6]) -> KResult<i64> {
    let old_addr = args[0];
    let old_size = args[1];
    let new_size = args[2];
    if new_size == 0 {
        return Err(Errno::EINVAL);
    }
    let map = current_map()?;
    let new_addr = vm::allocate(map, None, new_size)?;
    let copy_len = core::cmp::min(old_size, new_size) as usize;
    // Safety: both ranges were just handed back by this process's own vm
    // map and are mapped read/write in its (currently active) address
    // space; they do not overlap since `new_addr` came from a fresh
    // allocation.
    unsafe {
        core::ptr::copy_nonoverlapping(old_addr as *const u8, new_addr.0 as *mut u8, copy_len);
    }
    vm::free(map, VirtAddr(old_addr), old_size)?;
    Ok(new_addr.0 as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;

    fn reset_with_map() -> vm::MapId {
        ensure_platform();
        sched::init();
        let map = vm::create(vm::USERLIMIT, 1);
        sched::with_current_thread(|t| t.vm_map = Some(map));
        map
    }

    #[test]
    fn brk_queries_then_grows() {
        reset_with_map();
        let base = sys_brk(&[0; 6]).unwrap();
        assert_eq!(base, vm::BRK_BASE as i64);
        let grown = sys_brk(&[vm::BRK_BASE + 4096, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(grown, (vm::BRK_BASE + 4096) as i64);
    }

    #[test]
    fn mmap_then_munmap_round_trips() {
        reset_with_map();
        let addr = sys_mmap(&[0, 8192, PROT_WRITE, 0, u64::MAX, 0]).unwrap();
        assert!(addr > 0);
        assert_eq!((addr as u64) % 4096, 0);
        assert_eq!(sys_munmap(&[addr as u64, 8192, 0, 0, 0, 0]), Ok(0));
    }

    #[test]
    fn mmap_rejects_zero_length() {
        reset_with_map();
        assert_eq!(sys_mmap(&[0, 0, 0, 0, 0, 0]), Err(Errno::EINVAL));
    }

    #[test]
    fn mremap_copies_into_a_fresh_region() {
        reset_with_map();
        let old = sys_mmap(&[0, 4096, PROT_WRITE, 0, u64::MAX, 0]).unwrap() as u64;
        unsafe {
            (old as *mut u8).write(0x42);
        }
        let new_addr = sys_mremap(&[old, 4096, 8192, 0, 0, 0]).unwrap() as u64;
        assert_ne!(new_addr, old);
        unsafe {
            assert_eq!(*(new_addr as *const u8), 0x42);
        }
    }

    #[test]
    fn mmap_without_a_vm_map_returns_einval() {
        ensure_platform();
        sched::init();
        assert_eq!(sys_mmap(&[0, 4096, 0, 0, 0, 0]), Err(Errno::EINVAL));
    }
}
