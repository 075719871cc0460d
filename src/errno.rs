//! Kernel error codes and the `Result` alias used at every fallible API
//! boundary in this crate.
//!
//! The C core this crate generalizes returns a negative `errno` value on
//! failure; here that convention becomes a typed `Result<T, Errno>`. The
//! syscall dispatch trampoline (external collaborator territory) is
//! responsible for turning `Err(e)` into the negative-integer ABI value, so
//! the core itself never juggles raw negative integers.

/// POSIX-shaped kernel error codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Out of memory.
    ENOMEM = 1,
    /// Invalid argument.
    EINVAL,
    /// No such file or directory.
    ENOENT,
    /// File exists.
    EEXIST,
    /// Resource busy.
    EBUSY,
    /// Permission denied (access).
    EACCES,
    /// Operation not permitted.
    EPERM,
    /// No such process/thread.
    ESRCH,
    /// Try again.
    EAGAIN,
    /// Bad file descriptor.
    EBADF,
    /// Bad address.
    EFAULT,
    /// Too many open files.
    EMFILE,
    /// Not a directory.
    ENOTDIR,
    /// Is a directory.
    EISDIR,
    /// Directory not empty.
    ENOTEMPTY,
    /// Cross-device link.
    EXDEV,
    /// File name too long.
    ENAMETOOLONG,
    /// Function not implemented / syscall number not registered.
    ENOSYS,
    /// Timed out.
    ETIMEDOUT,
    /// Interrupted.
    EINTR,
    /// Operation not supported.
    EOPNOTSUPP,
    /// Protocol not available.
    ENOPROTOOPT,
    /// Address family not supported.
    EAFNOSUPPORT,
    /// Protocol not supported.
    EPROTONOSUPPORT,
}

impl Errno {
    /// The raw negative value a syscall ABI returns for this error.
    pub const fn to_raw(self) -> i64 {
        -(self as i32 as i64)
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Result alias used throughout this crate's public API.
pub type KResult<T> = Result<T, Errno>;
