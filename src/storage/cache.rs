//! On-disk block staging cache
//!
//! Blocks are staged under `<data_root>/staging/<file_id>.<file_version>/`
//! as `<block_id>.<block_version>` files.  Writes go through a pool of
//! flush threads; a reversion renames the whole per-version directory so
//! that a file-version bump never copies block data.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A pending flush.  Wait on it to learn where the block landed.
pub struct FlushTicket {
    rx: Mutex<Receiver<std::io::Result<PathBuf>>>,
}

impl FlushTicket {
    /// Block until the flush completes and return the staged path
    pub fn wait(self) -> Result<PathBuf> {
        match self.rx.lock().unwrap().recv() {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Cancelled),
        }
    }
}

struct FlushJob {
    path: PathBuf,
    data: Arc<Vec<u8>>,
    done: Sender<std::io::Result<PathBuf>>,
}

/// Content-staging cache for blocks awaiting (or surviving) replication
pub struct BlockCache {
    staging_root: PathBuf,
    jobs: Mutex<Option<Sender<FlushJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockCache {
    /// Create a new cache rooted at `staging_root`, with `num_threads`
    /// flush workers
    pub fn new(staging_root: PathBuf, num_threads: usize) -> Result<Self> {
        fs::create_dir_all(&staging_root)?;

        let (tx, rx) = mpsc::channel::<FlushJob>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(num_threads);

        for _ in 0..num_threads.max(1) {
            let rx = Arc::clone(&rx);
            workers.push(thread::spawn(move || loop {
                let job = {
                    let guard = rx.lock().unwrap();
                    guard.recv()
                };
                let Ok(job) = job else {
                    break;
                };
                let result = write_block_file(&job.path, &job.data);
                // The receiver may have been dropped; nothing to do then.
                let _ = job.done.send(result);
            }));
        }

        Ok(Self {
            staging_root,
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Per-version staging directory for a file
    fn file_dir(&self, file_id: u64, file_version: i64) -> PathBuf {
        self.staging_root
            .join(format!("{:016x}.{}", file_id, file_version))
    }

    /// Staged path of one block version
    pub fn block_path(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
    ) -> PathBuf {
        self.file_dir(file_id, file_version)
            .join(format!("{}.{}", block_id, block_version))
    }

    /// Submit a block buffer for background staging.  The cache guarantees
    /// a single writer per (file_id, file_version, block_id, block_version),
    /// which the flush state machine in [`crate::storage::dirty`] upholds.
    pub fn write_async(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
        data: Arc<Vec<u8>>,
    ) -> Result<FlushTicket> {
        let path = self.block_path(file_id, file_version, block_id, block_version);
        let (done, rx) = mpsc::channel();

        let guard = self.jobs.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::Cancelled);
        };
        tx.send(FlushJob { path, data, done })
            .map_err(|_| Error::Cancelled)?;

        Ok(FlushTicket { rx: Mutex::new(rx) })
    }

    /// Read a staged block back
    pub fn read_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
    ) -> Result<Vec<u8>> {
        let path = self.block_path(file_id, file_version, block_id, block_version);
        let mut file = File::open(&path).map_err(|_| {
            Error::NotFound(format!(
                "staged block {:x}.{}[{}.{}]",
                file_id, file_version, block_id, block_version
            ))
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Check whether a block is staged
    pub fn contains_block(
        &self,
        file_id: u64,
        file_version: i64,
        block_id: u64,
        block_version: i64,
    ) -> bool {
        self.block_path(file_id, file_version, block_id, block_version)
            .exists()
    }

    /// Drop a staged block.  Idempotent; missing blocks are fine.
    pub fn evict_block(&self, file_id: u64, file_version: i64, block_id: u64, block_version: i64) {
        let path = self.block_path(file_id, file_version, block_id, block_version);
        match fs::remove_file(&path) {
            Ok(()) => debug!(
                "Evicted staged block {:x}.{}[{}.{}]",
                file_id, file_version, block_id, block_version
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to evict {:?}: {}", path, e),
        }
    }

    /// Atomically rename a file's staging tree on a version bump
    pub fn reversion_file(&self, file_id: u64, old_version: i64, new_version: i64) -> Result<()> {
        let old_dir = self.file_dir(file_id, old_version);
        let new_dir = self.file_dir(file_id, new_version);

        if !old_dir.exists() {
            // No staged blocks for the old version; nothing to carry over
            return Ok(());
        }

        fs::rename(&old_dir, &new_dir)?;
        debug!(
            "Reversioned staging tree {:x}: {} -> {}",
            file_id, old_version, new_version
        );
        Ok(())
    }

    /// Drop a file's entire staging tree (unlink, coordinator handoff)
    pub fn evict_file(&self, file_id: u64, file_version: i64) {
        let dir = self.file_dir(file_id, file_version);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Failed to evict staging tree {:?}: {}", dir, e);
            }
        }
    }

    /// Stop the flush pool.  Pending tickets resolve as cancelled.
    pub fn shutdown(&self) {
        self.jobs.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for w in workers {
            let _ = w.join();
        }
    }
}

/// Write a block file via a temp file so a crashed flush never leaves a
/// half-written block behind
fn write_block_file(path: &PathBuf, data: &[u8]) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    fs::rename(&tmp, path)?;

    Ok(path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 2).unwrap();

        let data = Arc::new(vec![7u8; 4096]);
        let ticket = cache.write_async(0x100, 1, 0, 1, data.clone()).unwrap();
        let path = ticket.wait().unwrap();
        assert!(path.exists());

        let read = cache.read_block(0x100, 1, 0, 1).unwrap();
        assert_eq!(read, *data);
        cache.shutdown();
    }

    #[test]
    fn test_evict_idempotent() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 1).unwrap();

        let ticket = cache
            .write_async(0x100, 1, 3, 2, Arc::new(vec![1, 2, 3]))
            .unwrap();
        ticket.wait().unwrap();

        cache.evict_block(0x100, 1, 3, 2);
        cache.evict_block(0x100, 1, 3, 2);
        assert!(!cache.contains_block(0x100, 1, 3, 2));
        cache.shutdown();
    }

    #[test]
    fn test_reversion_renames_tree() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 1).unwrap();

        cache
            .write_async(0x200, 1, 0, 1, Arc::new(vec![9u8; 16]))
            .unwrap()
            .wait()
            .unwrap();

        cache.reversion_file(0x200, 1, 2).unwrap();
        assert!(!cache.contains_block(0x200, 1, 0, 1));
        assert!(cache.contains_block(0x200, 2, 0, 1));
        cache.shutdown();
    }

    #[test]
    fn test_reversion_missing_tree_ok() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 1).unwrap();
        cache.reversion_file(0x999, 1, 2).unwrap();
        cache.shutdown();
    }
}
