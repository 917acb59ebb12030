//! In-memory filesystem state: inodes, handles, and the path namespace

pub mod handle;
pub mod inode;
pub mod path;

pub use handle::{DirHandle, FileHandle};
pub use inode::{Inode, InodeType};
pub use path::Namespace;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as (sec, nsec)
pub fn now_timespec() -> (i64, i32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i32),
        Err(_) => (0, 0),
    }
}
