//! Per-process file descriptor table (§4.7).
//!
//! Near-direct port of the teacher's `fs::fd_table::FdTable`: a fixed-size
//! array, no heap allocation per lookup, trivially `Clone`-able for fork().
//! The only semantic change is `FdKind::File`, which here carries an index
//! into the crate-global open-file-description table ([`crate::vfs::file`])
//! rather than the teacher's bespoke "global file slots" array, since this
//! crate's VFS layer represents open files as reference-counted
//! descriptions shared across `dup`/`fork` rather than raw slot indices.

/// Maximum number of file descriptors per process.
pub const MAX_FDS: usize = 256;

/// What kind of kernel resource a file descriptor points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// Empty slot.
    None,
    /// An open-file description, see [`crate::vfs::file::OpenFile`].
    File { ofd_id: u32 },
    /// Read end of an anonymous pipe (not part of this crate's VFS core;
    /// reserved for an embedder's IPC layer).
    PipeRead { pipe_id: u32 },
    /// Write end of an anonymous pipe.
    PipeWrite { pipe_id: u32 },
    /// Console/tty — reserves fd 0/1/2 so the first `open()` starts at 3.
    Tty,
}

/// Per-FD flags (POSIX).
#[derive(Debug, Clone, Copy, Default)]
pub struct FdFlags {
    /// Close this FD on exec().
    pub cloexec: bool,
}

/// A single entry in the per-process FD table.
#[derive(Debug, Clone, Copy)]
pub struct FdEntry {
    /// The resource this FD refers to.
    pub kind: FdKind,
    /// Per-descriptor flags.
    pub flags: FdFlags,
}

impl FdEntry {
    const EMPTY: FdEntry = FdEntry { kind: FdKind::None, flags: FdFlags { cloexec: false } };
}

/// Per-process file descriptor table. Fixed-size array, no heap allocation.
#[derive(Clone)]
pub struct FdTable {
    entries: [FdEntry; MAX_FDS],
}

impl FdTable {
    /// An empty table (all slots `FdKind::None`).
    pub const fn new() -> Self {
        FdTable { entries: [FdEntry::EMPTY; MAX_FDS] }
    }

    /// Allocate the lowest available FD and assign it `kind`.
    pub fn alloc(&mut self, kind: FdKind) -> Option<u32> {
        self.alloc_above(0, kind)
    }

    /// Allocate the lowest available FD `>= min_fd` and assign it `kind`.
    pub fn alloc_above(&mut self, min_fd: u32, kind: FdKind) -> Option<u32> {
        let start = min_fd as usize;
        if start >= MAX_FDS {
            return None;
        }
        for i in start..MAX_FDS {
            if matches!(self.entries[i].kind, FdKind::None) {
                self.entries[i].kind = kind;
                self.entries[i].flags = FdFlags::default();
                return Some(i as u32);
            }
        }
        None
    }

    /// Place a resource at a specific FD slot (for `dup2`). The caller must
    /// have already closed whatever previously occupied `fd`.
    pub fn alloc_at(&mut self, fd: u32, kind: FdKind) -> bool {
        if (fd as usize) >= MAX_FDS {
            return false;
        }
        self.entries[fd as usize].kind = kind;
        self.entries[fd as usize].flags = FdFlags::default();
        true
    }

    /// Close an FD slot, returning the old `FdKind` for the caller to
    /// release (decref the open-file description etc.).
    pub fn close(&mut self, fd: u32) -> Option<FdKind> {
        if (fd as usize) >= MAX_FDS {
            return None;
        }
        let old = self.entries[fd as usize].kind;
        if matches!(old, FdKind::None) {
            return None;
        }
        self.entries[fd as usize] = FdEntry::EMPTY;
        Some(old)
    }

    /// Look up an FD's entry.
    pub fn get(&self, fd: u32) -> Option<&FdEntry> {
        if (fd as usize) >= MAX_FDS {
            return None;
        }
        let entry = &self.entries[fd as usize];
        if matches!(entry.kind, FdKind::None) { None } else { Some(entry) }
    }

    /// `dup2(old_fd, new_fd)`: point `new_fd` at whatever `old_fd` refers to.
    /// CLOEXEC is cleared on the new descriptor per POSIX. The caller must
    /// bump the underlying resource's refcount and close any prior occupant
    /// of `new_fd` first.
    pub fn dup2(&mut self, old_fd: u32, new_fd: u32) -> bool {
        if (old_fd as usize) >= MAX_FDS || (new_fd as usize) >= MAX_FDS {
            return false;
        }
        if matches!(self.entries[old_fd as usize].kind, FdKind::None) {
            return false;
        }
        self.entries[new_fd as usize].kind = self.entries[old_fd as usize].kind;
        self.entries[new_fd as usize].flags = FdFlags::default();
        true
    }

    /// Set or clear CLOEXEC on an FD.
    pub fn set_cloexec(&mut self, fd: u32, cloexec: bool) {
        if (fd as usize) < MAX_FDS {
            self.entries[fd as usize].flags.cloexec = cloexec;
        }
    }

    /// Close every FD with CLOEXEC set (called across `exec`), returning the
    /// closed kinds for refcount cleanup.
    pub fn close_cloexec(&mut self) -> alloc::vec::Vec<FdKind> {
        let mut closed = alloc::vec::Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.flags.cloexec && !matches!(entry.kind, FdKind::None) {
                closed.push(entry.kind);
                *entry = FdEntry::EMPTY;
            }
        }
        closed
    }

    /// Close every open FD (called on thread exit), returning the closed
    /// kinds for refcount cleanup.
    pub fn close_all(&mut self) -> alloc::vec::Vec<FdKind> {
        let mut closed = alloc::vec::Vec::new();
        for entry in self.entries.iter_mut() {
            if !matches!(entry.kind, FdKind::None) {
                closed.push(entry.kind);
                *entry = FdEntry::EMPTY;
            }
        }
        closed
    }

    /// Iterate open entries (for fork refcount incrementing).
    pub fn iter_open(&self) -> impl Iterator<Item = &FdEntry> {
        self.entries.iter().filter(|e| !matches!(e.kind, FdKind::None))
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_picks_lowest_free_slot() {
        let mut t = FdTable::new();
        assert_eq!(t.alloc(FdKind::Tty), Some(0));
        assert_eq!(t.alloc(FdKind::Tty), Some(1));
        t.close(0);
        assert_eq!(t.alloc(FdKind::File { ofd_id: 7 }), Some(0));
    }

    #[test]
    fn dup2_clears_cloexec_and_shares_kind() {
        let mut t = FdTable::new();
        let fd = t.alloc(FdKind::File { ofd_id: 3 }).unwrap();
        t.set_cloexec(fd, true);
        assert!(t.dup2(fd, 10));
        assert_eq!(t.get(10).unwrap().kind, FdKind::File { ofd_id: 3 });
        assert!(!t.get(10).unwrap().flags.cloexec);
    }

    #[test]
    fn close_all_returns_every_open_kind() {
        let mut t = FdTable::new();
        t.alloc(FdKind::Tty);
        t.alloc(FdKind::File { ofd_id: 1 });
        let closed = t.close_all();
        assert_eq!(closed.len(), 2);
        assert!(t.iter_open().next().is_none());
    }
}
