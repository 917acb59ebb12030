//! Metadata Service client interface
//!
//! The MS is the authoritative store of inodes, coordinators, versions, and
//! capabilities.  The gateway only depends on the trait here; the wire
//! client lives out-of-tree.  `MemMsClient` is a process-local stand-in
//! used by tests and standalone operation.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Entry type discriminator
pub const MD_ENTRY_FILE: u32 = 1;
/// Entry type discriminator
pub const MD_ENTRY_DIR: u32 = 2;

/// Capability bit: this gateway may take over file coordination
pub const CAP_COORDINATE: u64 = 0x2;
/// Capability bit: this gateway may write file data
pub const CAP_WRITE_DATA: u64 = 0x4;

/// MS-facing inode record, as published and fetched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MdEntry {
    pub entry_type: u32,
    pub file_id: u64,
    pub parent_id: u64,
    pub name: String,
    pub parent_name: String,
    pub volume: u64,
    pub coordinator: u64,
    pub owner: u64,
    pub mode: u32,
    pub size: u64,
    pub version: i64,
    pub ctime_sec: i64,
    pub ctime_nsec: i32,
    pub mtime_sec: i64,
    pub mtime_nsec: i32,
    pub manifest_mtime_sec: i64,
    pub manifest_mtime_nsec: i32,
    pub write_nonce: i64,
    pub xattr_nonce: i64,
    pub generation: i64,
    pub num_children: u64,
    pub capacity: u64,
    pub max_read_freshness: u64,
    pub max_write_freshness: u64,
}

/// Volume-wide constants served by the MS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: u64,
    pub name: String,
    pub block_size: u64,
}

/// The MS operations the gateway core depends on.
///
/// Implementations must be internally synchronized; callers treat them as
/// thread-safe.
pub trait MsClient: Send + Sync {
    /// Volume metadata (including the blocking factor)
    fn volume(&self) -> VolumeInfo;

    /// Capability bits granted to a gateway
    fn gateway_caps(&self, gateway_id: u64) -> u64;

    /// Publicly-reachable URL of a gateway, for peer requests
    fn gateway_url(&self, gateway_id: u64) -> Result<String>;

    /// Resolve a volume path to its current metadata
    fn lookup(&self, path: &str) -> Result<MdEntry>;

    /// Register a new entry; the MS assigns file_id and generation
    fn create(&self, path: &str, entry: MdEntry) -> Result<MdEntry>;

    /// Publish updated metadata.  Fails with `StaleVersion` when the
    /// caller's write nonce does not match the MS's.
    fn update(&self, path: &str, entry: &MdEntry) -> Result<MdEntry>;

    /// Remove an entry
    fn delete(&self, path: &str, entry: &MdEntry) -> Result<()>;

    /// Move an entry (and its subtree) to a new path
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Compare-and-swap the coordinator of a file.  On success returns the
    /// entry with the new coordinator; on a lost race returns
    /// `CoordinatorChanged` carrying the incumbent.
    fn coordinate(&self, path: &str, expected: u64, new_coordinator: u64) -> Result<MdEntry>;
}

/// In-memory MS double: one volume, flat path table
pub struct MemMsClient {
    volume: VolumeInfo,
    entries: Mutex<HashMap<String, MdEntry>>,
    caps: Mutex<HashMap<u64, u64>>,
    urls: Mutex<HashMap<u64, String>>,
    next_file_id: Mutex<u64>,
}

impl MemMsClient {
    pub fn new(volume_id: u64, block_size: u64) -> Self {
        Self {
            volume: VolumeInfo {
                volume_id,
                name: "mem".to_string(),
                block_size,
            },
            entries: Mutex::new(HashMap::new()),
            caps: Mutex::new(HashMap::new()),
            urls: Mutex::new(HashMap::new()),
            next_file_id: Mutex::new(0x1000),
        }
    }

    /// Grant capability bits to a gateway
    pub fn grant_caps(&self, gateway_id: u64, caps: u64) {
        self.caps.lock().unwrap().insert(gateway_id, caps);
    }

    /// Register a gateway's public URL
    pub fn register_gateway(&self, gateway_id: u64, url: &str) {
        self.urls.lock().unwrap().insert(gateway_id, url.to_string());
    }

    /// Current generation of an entry (test hook)
    pub fn generation_of(&self, path: &str) -> Option<i64> {
        self.entries.lock().unwrap().get(path).map(|e| e.generation)
    }
}

impl MsClient for MemMsClient {
    fn volume(&self) -> VolumeInfo {
        self.volume.clone()
    }

    fn gateway_caps(&self, gateway_id: u64) -> u64 {
        self.caps
            .lock()
            .unwrap()
            .get(&gateway_id)
            .copied()
            .unwrap_or(0)
    }

    fn gateway_url(&self, gateway_id: u64) -> Result<String> {
        self.urls
            .lock()
            .unwrap()
            .get(&gateway_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("gateway {}", gateway_id)))
    }

    fn lookup(&self, path: &str) -> Result<MdEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn create(&self, path: &str, mut entry: MdEntry) -> Result<MdEntry> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(path) {
            return Err(Error::AlreadyExists(path.to_string()));
        }

        let mut next = self.next_file_id.lock().unwrap();
        entry.file_id = *next;
        *next += 1;
        entry.generation = 1;
        entry.write_nonce = 1;

        entries.insert(path.to_string(), entry.clone());
        Ok(entry)
    }

    fn update(&self, path: &str, entry: &MdEntry) -> Result<MdEntry> {
        let mut entries = self.entries.lock().unwrap();
        let current = entries
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        if current.write_nonce != entry.write_nonce {
            return Err(Error::StaleVersion(format!(
                "{}: write nonce {} != {}",
                path, entry.write_nonce, current.write_nonce
            )));
        }

        let mut updated = entry.clone();
        updated.write_nonce = current.write_nonce + 1;
        updated.generation = current.generation + 1;
        *current = updated.clone();
        Ok(updated)
    }

    fn delete(&self, path: &str, _entry: &MdEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(from) {
            return Err(Error::NotFound(from.to_string()));
        }
        if entries.contains_key(to) {
            return Err(Error::AlreadyExists(to.to_string()));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = entries
            .keys()
            .filter(|k| *k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old_key in moved {
            let mut entry = entries.remove(&old_key).unwrap();
            let new_key = format!("{}{}", to, &old_key[from.len()..]);
            if old_key == from {
                entry.name = new_key.rsplit('/').next().unwrap_or(&new_key).to_string();
            }
            entry.write_nonce += 1;
            entries.insert(new_key, entry);
        }
        Ok(())
    }

    fn coordinate(&self, path: &str, expected: u64, new_coordinator: u64) -> Result<MdEntry> {
        let mut entries = self.entries.lock().unwrap();
        let current = entries
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        if current.coordinator != expected {
            return Err(Error::CoordinatorChanged(current.coordinator));
        }

        current.coordinator = new_coordinator;
        current.write_nonce += 1;
        Ok(current.clone())
    }
}
