//! Replication to Replica Gateways
//!
//! A replica context is a point-in-time snapshot of an inode's dirty set
//! and manifest, detached from the inode so replication can run without
//! the inode lock.  The transport itself is an external collaborator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::fs::inode::Inode;
use crate::manifest::Manifest;
use crate::ms::MdEntry;
use crate::storage::cache::BlockCache;
use crate::storage::dirty::DirtyBlock;

/// Block and manifest transport to the RGs serving this volume.
///
/// Implementations must be internally synchronized.
pub trait RgClient: Send + Sync {
    /// Store one block payload
    fn put_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
        data: Vec<u8>,
    ) -> Result<()>;

    /// Fetch one block payload
    fn get_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
    ) -> Result<Vec<u8>>;

    /// Store a serialized manifest, stamped with its modtime
    fn put_manifest(
        &self,
        file_id: u64,
        file_version: i64,
        modtime: (i64, i32),
        data: Vec<u8>,
    ) -> Result<()>;

    /// Delete one replicated block (vacuum)
    fn delete_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
    ) -> Result<()>;
}

/// Snapshot of everything one fsync must replicate
pub struct ReplicaContext {
    fs_path: String,
    file_id: u64,
    file_version: i64,
    manifest: Manifest,
    blocks: BTreeMap<u64, DirtyBlock>,
    inode_data: MdEntry,
}

impl ReplicaContext {
    /// Snapshot an inode's manifest and extracted dirty set.
    /// The caller must hold the inode's write lock.
    pub fn new(
        fs_path: &str,
        inode: &Inode,
        blocks: BTreeMap<u64, DirtyBlock>,
        parent_id: u64,
        parent_name: &str,
    ) -> Self {
        Self {
            fs_path: fs_path.to_string(),
            file_id: inode.file_id(),
            file_version: inode.file_version(),
            manifest: inode.manifest().clone(),
            blocks,
            inode_data: inode.export(parent_id, parent_name),
        }
    }

    pub fn fs_path(&self) -> &str {
        &self.fs_path
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn file_version(&self) -> i64 {
        self.file_version
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn inode_data(&self) -> &MdEntry {
        &self.inode_data
    }

    pub fn blocks(&self) -> &BTreeMap<u64, DirtyBlock> {
        &self.blocks
    }

    /// Give up the snapshot's blocks (for the restore path)
    pub fn take_blocks(&mut self) -> BTreeMap<u64, DirtyBlock> {
        std::mem::take(&mut self.blocks)
    }

    /// Flush every snapshot block to the local staging cache.
    /// Idempotent per block; safe to re-drive after a partial failure.
    pub fn flush_blocks(&mut self, cache: &BlockCache) -> Result<()> {
        for block in self.blocks.values_mut() {
            block.flush_async(cache, self.file_id, self.file_version)?;
        }

        let mut worst: Result<()> = Ok(());
        for block in self.blocks.values_mut() {
            if let Err(e) = block.flush_finish() {
                error!(
                    "Flush of block {:x}.{}[{}] failed: {}",
                    self.file_id,
                    self.file_version,
                    block.block_id(),
                    e
                );
                worst = Err(e);
            }
        }
        worst
    }
}

/// Replicate a snapshot: stage every block locally, then push blocks and
/// the manifest to the RGs.  Block payloads land before the manifest does,
/// so a published manifest never names a missing block.
pub fn replicate(cache: &BlockCache, rg: &dyn RgClient, rctx: &mut ReplicaContext) -> Result<()> {
    rctx.flush_blocks(cache)?;

    for block in rctx.blocks.values() {
        let payload = block.read_payload(cache, rctx.file_id, rctx.file_version)?;
        rg.put_block(
            rctx.file_id,
            rctx.file_version,
            block.block_id(),
            block.version(),
            payload,
        )?;
        debug!(
            "Replicated block {:x}.{}[{}.{}] ({})",
            rctx.file_id,
            rctx.file_version,
            block.block_id(),
            block.version(),
            hex::encode(&block.info().hash)
        );
    }

    // RGs see a clean manifest; dirty bits are purely local state
    let mut wire_manifest = rctx.manifest.clone();
    wire_manifest.clear_dirty_flags();
    rg.put_manifest(
        rctx.file_id,
        rctx.file_version,
        wire_manifest.modtime(),
        wire_manifest.encode(),
    )?;

    Ok(())
}

/// In-memory RG double used by tests: one process-local object store
pub struct MemRgClient {
    blocks: Mutex<HashMap<(u64, i64, u64, i64), Vec<u8>>>,
    manifests: Mutex<Vec<(u64, i64, (i64, i32))>>,
    fail_puts: Mutex<bool>,
    put_delay: Mutex<std::time::Duration>,
}

impl MemRgClient {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            manifests: Mutex::new(Vec::new()),
            fail_puts: Mutex::new(false),
            put_delay: Mutex::new(std::time::Duration::ZERO),
        }
    }

    /// Make every put fail (to exercise fsync restore paths)
    pub fn set_fail_puts(&self, fail: bool) {
        *self.fail_puts.lock().unwrap() = fail;
    }

    /// Slow every put down (to exercise fsync FIFO ordering)
    pub fn set_put_delay(&self, delay: std::time::Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    fn before_put(&self) -> Result<()> {
        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if *self.fail_puts.lock().unwrap() {
            return Err(Error::Io(std::io::Error::other("replica store down")));
        }
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn has_block(&self, file_id: u64, file_version: i64, block_id: u64, version: i64) -> bool {
        self.blocks
            .lock()
            .unwrap()
            .contains_key(&(file_id, file_version, block_id, version))
    }

    /// Manifest publication log, in arrival order (test hook)
    pub fn manifest_log(&self) -> Vec<(u64, i64, (i64, i32))> {
        self.manifests.lock().unwrap().clone()
    }
}

impl Default for MemRgClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RgClient for MemRgClient {
    fn put_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
        data: Vec<u8>,
    ) -> Result<()> {
        self.before_put()?;
        self.blocks
            .lock()
            .unwrap()
            .insert((file_id, file_version, block_id, block_version), data);
        Ok(())
    }

    fn get_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
    ) -> Result<Vec<u8>> {
        self.blocks
            .lock()
            .unwrap()
            .get(&(file_id, file_version, block_id, block_version))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "block {:x}.{}[{}.{}]",
                    file_id, file_version, block_id, block_version
                ))
            })
    }

    fn put_manifest(
        &self,
        file_id: u64,
        file_version: i64,
        modtime: (i64, i32),
        _data: Vec<u8>,
    ) -> Result<()> {
        self.before_put()?;
        self.manifests
            .lock()
            .unwrap()
            .push((file_id, file_version, modtime));
        Ok(())
    }

    fn delete_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
    ) -> Result<()> {
        self.blocks
            .lock()
            .unwrap()
            .remove(&(file_id, file_version, block_id, block_version));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::InodeType;
    use tempfile::tempdir;

    #[test]
    fn test_replicate_blocks_then_manifest() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 2).unwrap();
        let rg = MemRgClient::new();

        let mut inode = Inode::new(InodeType::File, "x", 1, 10, 0, 0o644);
        inode.set_file_id(0x100);
        inode
            .commit_dirty_block(&cache, DirtyBlock::new_dirty(0, 1, vec![1u8; 4096]))
            .unwrap();
        inode.manifest_mut().set_size(4096);
        inode.manifest_mut().set_modtime(100, 0);

        let blocks = inode.extract_modified();
        let mut rctx = ReplicaContext::new("/x", &inode, blocks, 1, "/");

        replicate(&cache, &rg, &mut rctx).unwrap();

        assert!(rg.has_block(0x100, 1, 0, 1));
        let log = rg.manifest_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (0x100, 1, (100, 0)));
        // Blocks got staged locally on the way out
        assert!(cache.contains_block(0x100, 1, 0, 1));
        cache.shutdown();
    }

    #[test]
    fn test_replicate_failure_keeps_blocks() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 1).unwrap();
        let rg = MemRgClient::new();
        rg.set_fail_puts(true);

        let mut inode = Inode::new(InodeType::File, "x", 1, 10, 0, 0o644);
        inode.set_file_id(0x100);
        inode
            .commit_dirty_block(&cache, DirtyBlock::new_dirty(0, 1, vec![1u8; 64]))
            .unwrap();

        let blocks = inode.extract_modified();
        let mut rctx = ReplicaContext::new("/x", &inode, blocks, 1, "/");

        assert!(replicate(&cache, &rg, &mut rctx).is_err());
        // Snapshot still owns its blocks; the restore path needs them
        assert_eq!(rctx.blocks().len(), 1);
        assert_eq!(rg.block_count(), 0);
        cache.shutdown();
    }
}
