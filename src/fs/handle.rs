//! Open-file and open-directory state

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::fs::inode::Inode;

/// Open-file flags the gateway cares about
pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;

/// An open file: a counted reference to the inode plus handle-local state
pub struct FileHandle {
    inode: Arc<RwLock<Inode>>,
    path: String,
    flags: u32,
    offset: u64,

    /// Clean blocks this handle caused to be cached, to drop on close if
    /// they were not re-dirtied: block_id -> version
    evict_hints: BTreeMap<u64, i64>,
}

impl FileHandle {
    pub fn new(inode: Arc<RwLock<Inode>>, path: &str, flags: u32) -> Self {
        Self {
            inode,
            path: path.to_string(),
            flags,
            offset: 0,
            evict_hints: BTreeMap::new(),
        }
    }

    pub fn inode(&self) -> &Arc<RwLock<Inode>> {
        &self.inode
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn writable(&self) -> bool {
        self.flags & (O_WRONLY | O_RDWR) != 0
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Remember to evict a clean cached block when this handle closes
    pub fn add_evict_hint(&mut self, block_id: u64, version: i64) {
        self.evict_hints.insert(block_id, version);
    }

    /// A later write re-dirtied this block; keep it
    pub fn drop_evict_hint(&mut self, block_id: u64) {
        self.evict_hints.remove(&block_id);
    }

    pub fn evict_hints(&self) -> &BTreeMap<u64, i64> {
        &self.evict_hints
    }
}

/// An open directory: a snapshot of child names plus a cursor
pub struct DirHandle {
    path: String,
    entries: Vec<String>,
    position: usize,
}

impl DirHandle {
    pub fn new(path: &str, entries: Vec<String>) -> Self {
        Self {
            path: path.to_string(),
            entries,
            position: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next batch of names, up to `count`
    pub fn read(&mut self, count: usize) -> &[String] {
        let start = self.position.min(self.entries.len());
        let end = (start + count).min(self.entries.len());
        self.position = end;
        &self.entries[start..end]
    }

    pub fn tell(&self) -> usize {
        self.position
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.entries.len());
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::InodeType;

    #[test]
    fn test_dir_handle_cursor() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut dh = DirHandle::new("/d", names);

        assert_eq!(dh.read(2), &["a".to_string(), "b".to_string()]);
        assert_eq!(dh.tell(), 2);
        assert_eq!(dh.read(5), &["c".to_string()]);
        assert!(dh.read(1).is_empty());

        dh.rewind();
        assert_eq!(dh.read(1), &["a".to_string()]);
        dh.seek(2);
        assert_eq!(dh.read(1), &["c".to_string()]);
    }

    #[test]
    fn test_evict_hints() {
        let inode = Arc::new(RwLock::new(Inode::new(
            InodeType::File,
            "x",
            1,
            1,
            0,
            0o644,
        )));
        let mut fh = FileHandle::new(inode, "/x", O_RDWR);
        assert!(fh.writable());

        fh.add_evict_hint(3, 1);
        fh.add_evict_hint(4, 2);
        fh.drop_evict_hint(3);
        assert_eq!(fh.evict_hints().len(), 1);
        assert_eq!(fh.evict_hints().get(&4), Some(&2));
    }
}
