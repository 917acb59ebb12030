//! File manifests: the per-file record of block versions and hashes
//!
//! A manifest maps block IDs to their current version, content hash, and
//! dirty bit.  The coordinator gateway is the only party that advances a
//! manifest's modification time, which is what makes manifest merging
//! well-defined across gateways.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-block metadata within a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block index within the file
    pub block_id: u64,

    /// Block version, assigned by the coordinator at commit
    pub version: i64,

    /// SHA256 hash of the block content
    pub hash: Vec<u8>,

    /// True if this block was written locally and not yet replicated.
    /// Dirty blocks survive remote manifest merges.
    pub dirty: bool,
}

impl BlockInfo {
    /// Make a new block record
    pub fn new(block_id: u64, version: i64, hash: Vec<u8>) -> Self {
        Self {
            block_id,
            version,
            hash,
            dirty: false,
        }
    }
}

/// A file manifest: ordered block map plus file-wide metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    volume_id: u64,
    coordinator_id: u64,
    file_id: u64,
    file_version: i64,
    size: u64,
    modtime_sec: i64,
    modtime_nsec: i32,
    blocks: BTreeMap<u64, BlockInfo>,
}

impl Manifest {
    /// Create an empty manifest for a file
    pub fn new(volume_id: u64, coordinator_id: u64, file_id: u64, file_version: i64) -> Self {
        Self {
            volume_id,
            coordinator_id,
            file_id,
            file_version,
            size: 0,
            modtime_sec: 0,
            modtime_nsec: 0,
            blocks: BTreeMap::new(),
        }
    }

    pub fn volume_id(&self) -> u64 {
        self.volume_id
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn file_version(&self) -> i64 {
        self.file_version
    }

    pub fn set_file_version(&mut self, version: i64) {
        self.file_version = version;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn coordinator(&self) -> u64 {
        self.coordinator_id
    }

    pub fn set_coordinator(&mut self, coordinator_id: u64) {
        self.coordinator_id = coordinator_id;
    }

    /// Manifest modification time as (sec, nsec)
    pub fn modtime(&self) -> (i64, i32) {
        (self.modtime_sec, self.modtime_nsec)
    }

    pub fn set_modtime(&mut self, sec: i64, nsec: i32) {
        self.modtime_sec = sec;
        self.modtime_nsec = nsec;
    }

    /// True if this manifest's modtime is strictly newer than the given one
    pub fn is_newer_than(&self, sec: i64, nsec: i32) -> bool {
        (self.modtime_sec, self.modtime_nsec) > (sec, nsec)
    }

    /// Insert a block record.  If `replace` is false and a record for this
    /// block already exists, fail with `AlreadyExists`.
    pub fn put_block(&mut self, info: BlockInfo, replace: bool) -> Result<()> {
        if !replace && self.blocks.contains_key(&info.block_id) {
            return Err(Error::AlreadyExists(format!(
                "block {}.{}",
                self.file_id, info.block_id
            )));
        }
        self.blocks.insert(info.block_id, info);
        Ok(())
    }

    /// Look up a block record
    pub fn lookup(&self, block_id: u64) -> Option<&BlockInfo> {
        self.blocks.get(&block_id)
    }

    /// Remove a block record, returning it if present
    pub fn delete(&mut self, block_id: u64) -> Option<BlockInfo> {
        self.blocks.remove(&block_id)
    }

    /// Drop every block record with `block_id >= max_id`
    pub fn truncate(&mut self, max_id: u64) {
        self.blocks.retain(|id, _| *id < max_id);
    }

    /// Iterate block records in block-id order
    pub fn iter(&self) -> impl Iterator<Item = (&u64, &BlockInfo)> {
        self.blocks.iter()
    }

    /// Highest block id present, or None for an empty manifest
    pub fn block_range(&self) -> Option<u64> {
        self.blocks.keys().next_back().copied()
    }

    /// Number of block records
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Set or clear the dirty bit on one block
    pub fn set_block_dirty(&mut self, block_id: u64, dirty: bool) {
        if let Some(info) = self.blocks.get_mut(&block_id) {
            info.dirty = dirty;
        }
    }

    /// Clear the dirty bit on every block (after the dirty set has been
    /// handed to a replica snapshot)
    pub fn clear_dirty_flags(&mut self) {
        for info in self.blocks.values_mut() {
            info.dirty = false;
        }
    }

    /// Remove every block record
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Merge another manifest's block records into this one.
    ///
    /// For each remote block: insert it if we have no record; skip it if the
    /// versions match; keep ours if ours is dirty; otherwise take the remote
    /// record only when the remote manifest's modtime is strictly newer.
    ///
    /// With at most one coordinator advancing modtime monotonically, this is
    /// commutative and associative over manifests with no dirty blocks.
    /// Size, modtime, and file version are not merged.
    ///
    /// Returns the block IDs whose records were replaced (not freshly
    /// inserted), so the caller can evict the superseded local state.
    pub fn merge_blocks(&mut self, remote: &Manifest) -> Vec<u64> {
        // Replacement requires the remote manifest to be strictly newer
        let take_remote = remote.is_newer_than(self.modtime_sec, self.modtime_nsec);
        let mut replaced = Vec::new();

        for (block_id, remote_block) in remote.blocks.iter() {
            match self.blocks.get(block_id) {
                None => {
                    let mut info = remote_block.clone();
                    info.dirty = false;
                    self.blocks.insert(*block_id, info);
                }
                Some(existing) => {
                    if existing.version == remote_block.version {
                        continue;
                    }
                    if existing.dirty {
                        continue;
                    }
                    if take_remote {
                        let mut info = remote_block.clone();
                        info.dirty = false;
                        self.blocks.insert(*block_id, info);
                        replaced.push(*block_id);
                    }
                }
            }
        }

        replaced
    }

    /// Encode to the length-prefixed wire form: fixed-width header fields
    /// followed by one entry per block.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 + self.blocks.len() * 32);
        body.extend_from_slice(&self.volume_id.to_le_bytes());
        body.extend_from_slice(&self.coordinator_id.to_le_bytes());
        body.extend_from_slice(&self.file_id.to_le_bytes());
        body.extend_from_slice(&self.file_version.to_le_bytes());
        body.extend_from_slice(&self.size.to_le_bytes());
        body.extend_from_slice(&self.modtime_sec.to_le_bytes());
        body.extend_from_slice(&self.modtime_nsec.to_le_bytes());
        body.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());

        for info in self.blocks.values() {
            body.extend_from_slice(&info.block_id.to_le_bytes());
            body.extend_from_slice(&info.version.to_le_bytes());
            body.push(info.dirty as u8);
            body.extend_from_slice(&(info.hash.len() as u32).to_le_bytes());
            body.extend_from_slice(&info.hash);
        }

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parse the wire form produced by [`Manifest::encode`]
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let body_len = r.u32()? as usize;
        if r.remaining() < body_len {
            return Err(Error::Corrupt(format!(
                "manifest record truncated: want {} bytes, have {}",
                body_len,
                r.remaining()
            )));
        }

        let mut m = Manifest {
            volume_id: r.u64()?,
            coordinator_id: r.u64()?,
            file_id: r.u64()?,
            file_version: r.i64()?,
            size: r.u64()?,
            modtime_sec: r.i64()?,
            modtime_nsec: r.i32()?,
            blocks: BTreeMap::new(),
        };

        let count = r.u32()?;
        for _ in 0..count {
            let block_id = r.u64()?;
            let version = r.i64()?;
            let dirty = r.u8()? != 0;
            let hash_len = r.u32()? as usize;
            let hash = r.bytes(hash_len)?;
            m.blocks.insert(
                block_id,
                BlockInfo {
                    block_id,
                    version,
                    hash,
                    dirty,
                },
            );
        }

        Ok(m)
    }
}

/// Cursor over a wire-form manifest record
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Corrupt("manifest record truncated".to_string()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }
}
