//! Dirty-block bookkeeping
//!
//! A `DirtyBlock` is an uncommitted (or cached) block buffer owned by an
//! inode.  Dirty blocks hold their payload in RAM until the flush pool
//! stages them; after that the staged path stands in for the buffer.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::manifest::BlockInfo;
use crate::storage::cache::{BlockCache, FlushTicket};

/// An in-memory block awaiting replication, or a cached clean copy of a
/// replicated block.
///
/// Invariant: a dirty block always has either a populated buffer or a
/// staged path.  A clean block cached here is eviction-eligible.
pub struct DirtyBlock {
    info: BlockInfo,
    buf: Option<Arc<Vec<u8>>>,
    staged: Option<PathBuf>,
    flushing: Option<FlushTicket>,
}

impl DirtyBlock {
    /// Make a dirty block from a freshly-written buffer.  The version is
    /// the caller's (the inode assigns it at commit) and the hash is
    /// computed here.
    pub fn new_dirty(block_id: u64, version: i64, buf: Vec<u8>) -> Self {
        let hash = Sha256::digest(&buf).to_vec();
        let mut info = BlockInfo::new(block_id, version, hash);
        info.dirty = true;
        Self {
            info,
            buf: Some(Arc::new(buf)),
            staged: None,
            flushing: None,
        }
    }

    /// Cache a clean (already-replicated) block buffer
    pub fn new_clean(info: BlockInfo, buf: Vec<u8>) -> Self {
        let mut info = info;
        info.dirty = false;
        Self {
            info,
            buf: Some(Arc::new(buf)),
            staged: None,
            flushing: None,
        }
    }

    pub fn block_id(&self) -> u64 {
        self.info.block_id
    }

    pub fn version(&self) -> i64 {
        self.info.version
    }

    pub fn dirty(&self) -> bool {
        self.info.dirty
    }

    /// Manifest-facing record for this block
    pub fn info(&self) -> &BlockInfo {
        &self.info
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.is_some()
    }

    /// Staged path, if the flush already completed
    pub fn staged(&self) -> Option<&PathBuf> {
        self.staged.as_ref()
    }

    /// In-RAM payload, if still resident
    pub fn buffer(&self) -> Option<&Arc<Vec<u8>>> {
        self.buf.as_ref()
    }

    /// True if this block's buffer is not shared with any snapshot
    pub fn unshared(&self) -> bool {
        match &self.buf {
            Some(buf) => Arc::strong_count(buf) == 1,
            None => true,
        }
    }

    /// Deep-copy the buffer if a snapshot still shares it.  Required before
    /// mutating a preserved-but-shared block in place.
    pub fn unshare(&mut self) {
        if let Some(buf) = &self.buf {
            if Arc::strong_count(buf) > 1 {
                self.buf = Some(Arc::new(buf.as_ref().clone()));
            }
        }
    }

    /// Begin staging this block's buffer to the cache.
    ///
    /// Skips (successfully) if the block is already staged or already
    /// flushing, so the caller may re-drive a partially-flushed set.
    /// Fails with `InvalidArgument` if there is no buffer to flush.
    pub fn flush_async(
        &mut self,
        cache: &BlockCache,
        file_id: u64,
        file_version: i64,
    ) -> Result<()> {
        if self.staged.is_some() || self.flushing.is_some() {
            return Ok(());
        }

        let Some(buf) = &self.buf else {
            return Err(Error::InvalidArgument(format!(
                "block {}.{} has no buffer to flush",
                self.info.block_id, self.info.version
            )));
        };

        let ticket = cache.write_async(
            file_id,
            file_version,
            self.info.block_id,
            self.info.version,
            Arc::clone(buf),
        )?;
        self.flushing = Some(ticket);
        Ok(())
    }

    /// Wait for an in-flight flush and record the staged path.
    /// Idempotent when no flush is in flight.
    pub fn flush_finish(&mut self) -> Result<()> {
        if let Some(ticket) = self.flushing.take() {
            let path = ticket.wait()?;
            self.staged = Some(path);
        }
        Ok(())
    }

    /// Release this block's staged data and buffer.  Idempotent.
    pub fn evict_and_free(&mut self, cache: &BlockCache, file_id: u64, file_version: i64) {
        // Settle any in-flight flush first so the eviction below sees it
        let _ = self.flush_finish();

        if self.staged.take().is_some() {
            cache.evict_block(file_id, file_version, self.info.block_id, self.info.version);
        }
        self.buf = None;
    }

    /// Read the block payload from RAM or the staging cache
    pub fn read_payload(&self, cache: &BlockCache, file_id: u64, file_version: i64) -> Result<Vec<u8>> {
        if let Some(buf) = &self.buf {
            return Ok(buf.as_ref().clone());
        }
        if self.staged.is_some() {
            return cache.read_block(file_id, file_version, self.info.block_id, self.info.version);
        }
        Err(Error::NotFound(format!(
            "block {}.{} has no payload",
            self.info.block_id, self.info.version
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_dirty_hashes() {
        let d = DirtyBlock::new_dirty(3, 1, vec![1, 2, 3]);
        assert!(d.dirty());
        assert_eq!(d.info().hash, Sha256::digest([1u8, 2, 3]).to_vec());
        assert!(d.buffer().is_some());
        assert!(d.staged().is_none());
    }

    #[test]
    fn test_flush_idempotent() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 1).unwrap();

        let mut d = DirtyBlock::new_dirty(0, 1, vec![5u8; 128]);
        d.flush_async(&cache, 0x100, 1).unwrap();
        // Second flush while in flight is a no-op
        d.flush_async(&cache, 0x100, 1).unwrap();
        d.flush_finish().unwrap();
        assert!(d.staged().is_some());

        // Already staged: both calls are no-ops
        d.flush_async(&cache, 0x100, 1).unwrap();
        d.flush_finish().unwrap();
        assert!(cache.contains_block(0x100, 1, 0, 1));
        cache.shutdown();
    }

    #[test]
    fn test_unshare_breaks_sharing() {
        let mut d = DirtyBlock::new_dirty(0, 1, vec![1u8; 8]);
        let shared = Arc::clone(d.buffer().unwrap());
        assert!(!d.unshared());

        d.unshare();
        assert!(d.unshared());
        assert_eq!(**d.buffer().unwrap(), *shared);
    }

    #[test]
    fn test_evict_and_free_idempotent() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 1).unwrap();

        let mut d = DirtyBlock::new_dirty(2, 4, vec![9u8; 64]);
        d.flush_async(&cache, 0x100, 1).unwrap();
        d.flush_finish().unwrap();
        assert!(cache.contains_block(0x100, 1, 2, 4));

        d.evict_and_free(&cache, 0x100, 1);
        assert!(!cache.contains_block(0x100, 1, 2, 4));
        assert!(d.buffer().is_none());

        d.evict_and_free(&cache, 0x100, 1);
    }
}
