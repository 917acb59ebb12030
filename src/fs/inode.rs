//! Inodes: per-file state owned by the gateway
//!
//! An inode exclusively owns its manifest, its dirty-block map, its
//! replaced-block ledger, and its fsync queue.  Every mutating operation
//! here expects the caller to hold the inode's write lock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{BlockInfo, Manifest};
use crate::ms::{MdEntry, MD_ENTRY_DIR, MD_ENTRY_FILE};
use crate::storage::cache::BlockCache;
use crate::storage::dirty::DirtyBlock;
use crate::sync::Semaphore;

/// Inode type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    File,
    Dir,
}

impl InodeType {
    pub fn as_md_type(&self) -> u32 {
        match self {
            InodeType::File => MD_ENTRY_FILE,
            InodeType::Dir => MD_ENTRY_DIR,
        }
    }
}

/// Per-file gateway state
pub struct Inode {
    file_id: u64,
    parent_id: u64,
    name: String,
    itype: InodeType,
    owner: u64,
    mode: u32,
    ctime: (i64, i32),
    mtime: (i64, i32),

    manifest: Manifest,

    /// Prior block versions awaiting vacuum, keyed like a manifest
    replaced: Manifest,

    /// Uncommitted block buffers and cached clean blocks
    dirty: BTreeMap<u64, DirtyBlock>,

    /// FIFO of waiting fsyncs (each waiter holds a zero-valued semaphore)
    sync_queue: VecDeque<Arc<Semaphore>>,

    /// True while an fsync holds the front of the queue
    sync_running: bool,

    // MS freshness bookkeeping
    write_nonce: i64,
    xattr_nonce: i64,
    generation: i64,
    max_read_freshness_ms: u64,
    max_write_freshness_ms: u64,
    ms_num_children: u64,
    ms_capacity: u64,
    refreshed_at: Instant,
    metadata_stale: bool,

    /// Modtime of the last successfully vacuumed manifest
    old_manifest_modtime: (i64, i32),

    open_count: u64,
    link_count: u64,

    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Inode {
    /// Create a fresh local inode
    pub fn new(
        itype: InodeType,
        name: &str,
        volume_id: u64,
        coordinator_id: u64,
        owner: u64,
        mode: u32,
    ) -> Self {
        Self {
            file_id: 0,
            parent_id: 0,
            name: name.to_string(),
            itype,
            owner,
            mode,
            ctime: (0, 0),
            mtime: (0, 0),
            manifest: Manifest::new(volume_id, coordinator_id, 0, 1),
            replaced: Manifest::new(volume_id, coordinator_id, 0, 1),
            dirty: BTreeMap::new(),
            sync_queue: VecDeque::new(),
            sync_running: false,
            write_nonce: 0,
            xattr_nonce: 0,
            generation: 0,
            max_read_freshness_ms: 0,
            max_write_freshness_ms: 0,
            ms_num_children: 0,
            ms_capacity: 0,
            refreshed_at: Instant::now(),
            metadata_stale: false,
            old_manifest_modtime: (0, 0),
            open_count: 0,
            link_count: 1,
            xattrs: BTreeMap::new(),
        }
    }

    /// Build an inode from an MS record (lookup path)
    pub fn from_entry(entry: &MdEntry) -> Self {
        let itype = if entry.entry_type == MD_ENTRY_DIR {
            InodeType::Dir
        } else {
            InodeType::File
        };

        let mut inode = Self::new(
            itype,
            &entry.name,
            entry.volume,
            entry.coordinator,
            entry.owner,
            entry.mode,
        );
        inode.file_id = entry.file_id;
        inode.parent_id = entry.parent_id;
        inode.ctime = (entry.ctime_sec, entry.ctime_nsec);
        inode.mtime = (entry.mtime_sec, entry.mtime_nsec);
        inode.manifest = Manifest::new(entry.volume, entry.coordinator, entry.file_id, entry.version);
        inode.manifest.set_size(entry.size);
        inode
            .manifest
            .set_modtime(entry.manifest_mtime_sec, entry.manifest_mtime_nsec);
        inode.replaced = Manifest::new(entry.volume, entry.coordinator, entry.file_id, entry.version);
        inode.write_nonce = entry.write_nonce;
        inode.xattr_nonce = entry.xattr_nonce;
        inode.generation = entry.generation;
        inode.max_read_freshness_ms = entry.max_read_freshness;
        inode.max_write_freshness_ms = entry.max_write_freshness;
        inode.ms_num_children = entry.num_children;
        inode.ms_capacity = entry.capacity;
        inode
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn set_file_id(&mut self, file_id: u64) {
        self.file_id = file_id;
    }

    pub fn parent_id(&self) -> u64 {
        self.parent_id
    }

    pub fn set_parent_id(&mut self, parent_id: u64) {
        self.parent_id = parent_id;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn itype(&self) -> InodeType {
        self.itype
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn set_owner(&mut self, owner: u64) {
        self.owner = owner;
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode;
    }

    pub fn size(&self) -> u64 {
        self.manifest.size()
    }

    pub fn file_version(&self) -> i64 {
        self.manifest.file_version()
    }

    pub fn coordinator(&self) -> u64 {
        self.manifest.coordinator()
    }

    pub fn set_coordinator(&mut self, coordinator: u64) {
        self.manifest.set_coordinator(coordinator);
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    pub fn replaced_blocks(&self) -> &Manifest {
        &self.replaced
    }

    pub fn dirty_blocks(&self) -> &BTreeMap<u64, DirtyBlock> {
        &self.dirty
    }

    pub fn write_nonce(&self) -> i64 {
        self.write_nonce
    }

    pub fn xattr_nonce(&self) -> i64 {
        self.xattr_nonce
    }

    /// Record the nonce and generation the MS assigned to a publish
    pub fn note_published(&mut self, write_nonce: i64, generation: i64) {
        self.write_nonce = write_nonce;
        self.generation = generation;
        self.mark_refreshed();
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn metadata_stale(&self) -> bool {
        self.metadata_stale
    }

    pub fn set_metadata_stale(&mut self, stale: bool) {
        self.metadata_stale = stale;
    }

    /// True if cached read metadata has outlived its freshness window
    pub fn read_stale(&self) -> bool {
        self.metadata_stale
            || self.refreshed_at.elapsed().as_millis() as u64 > self.max_read_freshness_ms
    }

    pub fn mark_refreshed(&mut self) {
        self.refreshed_at = Instant::now();
        self.metadata_stale = false;
    }

    pub fn old_manifest_modtime(&self) -> (i64, i32) {
        self.old_manifest_modtime
    }

    pub fn set_old_manifest_modtime(&mut self, modtime: (i64, i32)) {
        self.old_manifest_modtime = modtime;
    }

    pub fn set_mtime(&mut self, mtime: (i64, i32)) {
        self.mtime = mtime;
    }

    pub fn open_count(&self) -> u64 {
        self.open_count
    }

    pub fn opened(&mut self) {
        self.open_count += 1;
    }

    pub fn closed(&mut self) {
        self.open_count = self.open_count.saturating_sub(1);
    }

    pub fn link_count(&self) -> u64 {
        self.link_count
    }

    pub fn unlinked(&mut self) {
        self.link_count = self.link_count.saturating_sub(1);
    }

    /// An inode is destroyed once nothing links to it and nothing holds it
    pub fn can_destroy(&self) -> bool {
        self.link_count == 0 && self.open_count == 0
    }

    pub fn xattrs(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.xattrs
    }

    pub fn set_xattr(&mut self, name: &str, value: Vec<u8>) {
        self.xattrs.insert(name.to_string(), value);
        self.xattr_nonce += 1;
    }

    pub fn remove_xattr(&mut self, name: &str) -> Result<()> {
        match self.xattrs.remove(name) {
            Some(_) => {
                self.xattr_nonce += 1;
                Ok(())
            }
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    /// Next version for a block: strictly greater than any prior version
    pub fn next_block_version(&self, block_id: u64) -> i64 {
        self.manifest
            .lookup(block_id)
            .map(|b| b.version + 1)
            .unwrap_or(1)
    }

    /// Commit a dirty block: update the manifest, take ownership of the
    /// buffer, and remember the displaced version for vacuuming.
    ///
    /// All-or-nothing: on failure the manifest, dirty map, and replaced
    /// ledger are left exactly as they were.
    pub fn commit_dirty_block(&mut self, cache: &BlockCache, block: DirtyBlock) -> Result<()> {
        if !block.dirty() {
            return Err(Error::InvalidArgument(format!(
                "block {}.{} is not dirty",
                block.block_id(),
                block.version()
            )));
        }

        let block_id = block.block_id();
        let version = block.version();
        let old_info = self.manifest.lookup(block_id).cloned();

        let mut info = block.info().clone();
        info.dirty = true;
        self.manifest.put_block(info, true)?;

        let old_dirty = self.dirty.insert(block_id, block);

        // The displaced manifest record becomes garbage to vacuum, unless a
        // still-older version is already ledgered for this block.  A
        // same-version re-commit (the restore path) displaces nothing.
        if let Some(old) = old_info.filter(|old| old.version != version) {
            if self.replaced.lookup(block_id).is_none() {
                let mut garbage = old;
                garbage.dirty = false;
                self.replaced.put_block(garbage, true)?;
            }
        }

        if let Some(mut old) = old_dirty {
            old.evict_and_free(cache, self.file_id, self.manifest.file_version());
        }

        Ok(())
    }

    /// Cache a clean (replicated) block buffer in the dirty map.
    ///
    /// A no-op if the same version is already cached; fails with
    /// `AlreadyExists` if a different version is cached, and with
    /// `InvalidArgument` if the block is dirty.
    pub fn cache_clean_block(&mut self, block: DirtyBlock) -> Result<()> {
        if block.dirty() {
            return Err(Error::InvalidArgument(format!(
                "block {} is dirty",
                block.block_id()
            )));
        }

        if let Some(existing) = self.dirty.get(&block.block_id()) {
            if existing.version() == block.version() {
                return Ok(());
            }
            return Err(Error::AlreadyExists(format!(
                "block {} cached at version {}",
                block.block_id(),
                existing.version()
            )));
        }

        self.dirty.insert(block.block_id(), block);
        Ok(())
    }

    /// Merge a remote manifest's blocks into ours.
    ///
    /// Dirty local blocks always win.  Every replaced block has its cached
    /// copy evicted, its dirty-map entry freed, and its replaced-ledger
    /// entry dropped (the remote coordinator owns that garbage now).
    pub fn merge_manifest(&mut self, cache: &BlockCache, remote: &Manifest) {
        // Versions about to be displaced, for cache eviction afterwards
        let mut old_versions: BTreeMap<u64, i64> = BTreeMap::new();
        for (block_id, _) in remote.iter() {
            if let Some(existing) = self.manifest.lookup(*block_id) {
                old_versions.insert(*block_id, existing.version);
            }
        }

        let replaced = self.manifest.merge_blocks(remote);
        let file_version = self.manifest.file_version();

        for block_id in replaced {
            if let Some(old_version) = old_versions.get(&block_id) {
                cache.evict_block(self.file_id, file_version, block_id, *old_version);
            }
            if let Some(mut stale) = self.dirty.remove(&block_id) {
                stale.evict_and_free(cache, self.file_id, file_version);
            }
            self.replaced.delete(block_id);
        }
    }

    /// Block records a truncation to `new_size` would drop
    pub fn truncate_find_removed(&self, block_size: u64, new_size: u64) -> Vec<BlockInfo> {
        let drop_id = new_size.div_ceil(block_size);
        self.manifest
            .iter()
            .filter(|(id, _)| **id >= drop_id)
            .map(|(_, info)| info.clone())
            .collect()
    }

    /// Shrink (or grow) the file to `new_size`, dropping every whole block
    /// past the boundary from the manifest, the dirty map, and the cache.
    ///
    /// A non-zero `new_version` reversions the file: the manifest version
    /// is bumped and the staging tree is renamed.  Truncation does not
    /// ledger the dropped blocks; the reversion covers their old object
    /// names.  Zero-filling the straddling tail block is the write layer's
    /// job, not ours.
    pub fn truncate(
        &mut self,
        cache: &BlockCache,
        block_size: u64,
        new_size: u64,
        new_version: i64,
    ) {
        let drop_id = new_size.div_ceil(block_size);
        let old_version = self.manifest.file_version();

        let dead: Vec<(u64, i64)> = self
            .manifest
            .iter()
            .filter(|(id, _)| **id >= drop_id)
            .map(|(id, info)| (*id, info.version))
            .collect();

        for (block_id, version) in dead {
            if let Some(mut stale) = self.dirty.remove(&block_id) {
                stale.evict_and_free(cache, self.file_id, old_version);
            }
            cache.evict_block(self.file_id, old_version, block_id, version);
        }

        if new_version != 0 {
            self.manifest.set_file_version(new_version);
            if let Err(e) = cache.reversion_file(self.file_id, old_version, new_version) {
                debug!(
                    "Reversion of staging tree {:x} ({} -> {}) failed: {}",
                    self.file_id, old_version, new_version, e
                );
            }
        }

        self.manifest.truncate(drop_id);
        self.manifest.set_size(new_size);
    }

    /// Pull every dirty entry out of the dirty map, leaving cached clean
    /// blocks in place.  The caller owns the result (a replica snapshot).
    pub fn extract_modified(&mut self) -> BTreeMap<u64, DirtyBlock> {
        let dirty_ids: Vec<u64> = self
            .dirty
            .iter()
            .filter(|(_, d)| d.dirty())
            .map(|(id, _)| *id)
            .collect();

        let mut modified = BTreeMap::new();
        for id in dirty_ids {
            if let Some(d) = self.dirty.remove(&id) {
                modified.insert(id, d);
            }
        }
        modified
    }

    /// Put extracted blocks back (early fsync failure, before replication)
    pub fn return_extracted(&mut self, blocks: BTreeMap<u64, DirtyBlock>) {
        for (id, d) in blocks {
            self.dirty.insert(id, d);
        }
    }

    /// Start a fresh dirty map, discarding whatever is left in the old
    /// one.  Once the dirty subset has been extracted into a snapshot,
    /// the remainder is an in-RAM cache of replicated blocks; an fsync
    /// drops the whole map rather than letting that cache accrete.
    pub fn replace_dirty_blocks(&mut self, cache: &BlockCache) {
        let discarded = std::mem::take(&mut self.dirty);
        let file_version = self.manifest.file_version();
        for (_, mut block) in discarded {
            block.evict_and_free(cache, self.file_id, file_version);
        }
    }

    /// Drop the replaced-block ledger (its contents are now owned by a
    /// vacuum context)
    pub fn clear_replaced_blocks(&mut self) {
        self.replaced.clear();
    }

    /// Re-ledger garbage from a failed vacuum context, without clobbering
    /// entries written since the snapshot
    pub fn restore_replaced_blocks(&mut self, garbage: &Manifest) {
        for (block_id, info) in garbage.iter() {
            if self.replaced.lookup(*block_id).is_none() {
                let _ = self.replaced.put_block(info.clone(), false);
            }
        }
    }

    /// Flush RAM-resident dirty buffers to the staging cache, keeping only
    /// the blocks in `preserve` resident (unshared so they can be mutated).
    pub fn trim_dirty_blocks(&mut self, cache: &BlockCache, preserve: &[u64]) -> Result<()> {
        let file_id = self.file_id;
        let file_version = self.manifest.file_version();

        for (block_id, block) in self.dirty.iter_mut() {
            if preserve.contains(block_id) {
                block.unshare();
                continue;
            }
            block.flush_async(cache, file_id, file_version)?;
        }

        // Settle every in-flight flush, even if one fails
        let mut worst: Result<()> = Ok(());
        for block in self.dirty.values_mut() {
            if let Err(e) = block.flush_finish() {
                worst = Err(e);
            }
        }
        worst
    }

    /// Apply a handle's deferred eviction hints: drop hinted clean blocks
    /// whose version still matches
    pub fn evict_hinted_blocks(&mut self, hints: &BTreeMap<u64, i64>) {
        for (block_id, version) in hints {
            let matches = self
                .dirty
                .get(block_id)
                .map(|d| !d.dirty() && d.version() == *version)
                .unwrap_or(false);
            if matches {
                self.dirty.remove(block_id);
            }
        }
    }

    // --- fsync FIFO ---

    pub fn sync_queue_len(&self) -> usize {
        self.sync_queue.len()
    }

    pub fn sync_running(&self) -> bool {
        self.sync_running
    }

    pub fn set_sync_running(&mut self, running: bool) {
        self.sync_running = running;
    }

    pub fn sync_queue_push(&mut self, waiter: Arc<Semaphore>) {
        self.sync_queue.push_back(waiter);
    }

    pub fn sync_queue_pop(&mut self) -> Option<Arc<Semaphore>> {
        self.sync_queue.pop_front()
    }

    // --- export / import ---

    /// Copy metadata out to an MS-facing record
    pub fn export(&self, parent_id: u64, parent_name: &str) -> MdEntry {
        let (manifest_mtime_sec, manifest_mtime_nsec) = self.manifest.modtime();
        MdEntry {
            entry_type: self.itype.as_md_type(),
            file_id: self.file_id,
            parent_id,
            name: self.name.clone(),
            parent_name: parent_name.to_string(),
            volume: self.manifest.volume_id(),
            coordinator: self.manifest.coordinator(),
            owner: self.owner,
            mode: self.mode,
            size: self.manifest.size(),
            version: self.manifest.file_version(),
            ctime_sec: self.ctime.0,
            ctime_nsec: self.ctime.1,
            mtime_sec: self.mtime.0,
            mtime_nsec: self.mtime.1,
            manifest_mtime_sec,
            manifest_mtime_nsec,
            write_nonce: self.write_nonce,
            xattr_nonce: self.xattr_nonce,
            generation: self.generation,
            num_children: self.ms_num_children,
            capacity: self.ms_capacity,
            max_read_freshness: self.max_read_freshness_ms,
            max_write_freshness: self.max_write_freshness_ms,
        }
    }

    /// Import refreshed metadata from the MS.
    ///
    /// The record's file ID, type, version, name, and size must agree with
    /// the inode; disagreements mean a rename, reversion, or re-open has to
    /// reconcile things first, so they are rejected here.
    pub fn import(&mut self, entry: &MdEntry) -> Result<()> {
        if entry.file_id != self.file_id {
            return Err(Error::InvalidArgument(format!(
                "file id mismatch: {:x} != {:x}",
                entry.file_id, self.file_id
            )));
        }
        if entry.entry_type != self.itype.as_md_type() {
            return Err(Error::InvalidArgument("entry type mismatch".to_string()));
        }
        if entry.version != self.manifest.file_version() {
            return Err(Error::InvalidArgument(format!(
                "version mismatch: {} != {}",
                entry.version,
                self.manifest.file_version()
            )));
        }
        if entry.name != self.name {
            return Err(Error::InvalidArgument(format!(
                "name mismatch: {} != {}",
                entry.name, self.name
            )));
        }
        if entry.size != self.manifest.size() {
            return Err(Error::InvalidArgument(format!(
                "size mismatch: {} != {}",
                entry.size,
                self.manifest.size()
            )));
        }

        self.ctime = (entry.ctime_sec, entry.ctime_nsec);
        self.mtime = (entry.mtime_sec, entry.mtime_nsec);
        self.owner = entry.owner;
        self.mode = entry.mode;
        self.manifest.set_coordinator(entry.coordinator);
        self.write_nonce = entry.write_nonce;
        self.xattr_nonce = entry.xattr_nonce;
        self.generation = entry.generation;
        self.ms_num_children = entry.num_children;
        self.ms_capacity = entry.capacity;
        self.max_read_freshness_ms = entry.max_read_freshness;
        self.max_write_freshness_ms = entry.max_write_freshness;
        self.mark_refreshed();
        Ok(())
    }
}
