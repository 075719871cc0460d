//! System-call surface (§4.8, §6 "External interfaces").
//!
//! A process-wide [`table`] maps a small integer syscall number to a
//! handler function pointer. Each of [`process`], [`memory`], [`vfs`] and
//! [`time`] registers its own handlers via [`table::set_syscall`] when
//! [`init`] runs; an unregistered number falls through to `ENOSYS`. This
//! decouples the syscall surface from any particular architecture's trap
//! glue, generalizing the teacher's fixed `match` over `SYS_*` constants in
//! `syscall::table`/`syscall::dispatch` into a real registration table.
//!
//! Sockets (§6: "a dispatch table routing (domain, type, protocol) to
//! per-domain backends") are out of scope here: every backend the teacher
//! ships (display, audio, security, networking) is external-collaborator
//! territory this crate's purpose statement excludes, and a socket dispatch
//! table with no registered domain behind it would just be dead scaffolding.

pub mod table;

mod helpers;

pub mod memory;
pub mod process;
pub mod time;
pub mod vfs;

pub use table::{dispatch, set_syscall, Handler};

/// Register every syscall handler this crate implements. Call once during
/// boot, after [`crate::sched::init`] (handlers call into the scheduler and
/// VFS layer immediately upon being invoked, so those must already be up,
/// though registration itself only populates the table).
pub fn init() {
    process::install();
    memory::install();
    vfs::install();
    time::install();
    log::info!("syscall table installed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ensure_platform;

    #[test]
    fn gettid_is_reachable_through_dispatch() {
        ensure_platform();
        crate::sched::init();
        init();
        let ret = dispatch(process::SYS_GETTID, &[0; 6]);
        assert_eq!(ret, Ok(crate::sched::current_tid() as i64));
    }

    #[test]
    fn an_unregistered_number_is_enosys() {
        ensure_platform();
        crate::sched::init();
        init();
        assert_eq!(dispatch(499, &[0; 6]), Err(crate::errno::Errno::ENOSYS));
    }
}
