//! Virtual filesystem: vnode cache, mount table, path resolution, open-file
//! descriptions, and the per-process file descriptor table (§4.7).

pub mod fd_table;
pub mod file;
pub mod vnode;
pub mod mount;
pub mod cache;
pub mod namei;
pub mod path;
pub mod ramfs;
pub mod devfs;
