//! The fsync pipeline
//!
//! An fsync snapshots the inode's dirty set under the write lock, then
//! replicates without it.  A per-inode FIFO of semaphores serializes
//! concurrent fsyncs so manifests reach the RGs in snapshot order; that
//! ordering is the sole source of manifest modtime monotonicity.
//!
//! The inode lock is never held across an RG or MS round trip.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::fs::inode::{Inode, InodeType};
use crate::gateway::Gateway;
use crate::replication::{self, ReplicaContext};
use crate::storage::cache::BlockCache;
use crate::storage::dirty::DirtyBlock;
use crate::vacuum::VacuumContext;

/// Counting semaphore for the per-inode fsync FIFO
pub struct Semaphore {
    count: Mutex<u64>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// What to do with one block of a failed snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreAction {
    /// Re-commit the block; its write is still the latest
    Recommit,
    /// The file was reversioned and this block now lies past its end
    DropTruncated,
    /// A post-snapshot write superseded this block
    DropSuperseded,
}

/// Classify every block of a failed replication snapshot.
///
/// Pure over its inputs: `current_versions` is the live dirty map's
/// (block_id -> version) view at restore time.
pub fn restore_plan(
    old_file_version: i64,
    current_file_version: i64,
    old_size: u64,
    block_size: u64,
    current_versions: &BTreeMap<u64, i64>,
    snapshot: &BTreeMap<u64, DirtyBlock>,
) -> Vec<(u64, RestoreAction)> {
    snapshot
        .iter()
        .map(|(block_id, block)| {
            if current_file_version != old_file_version && block_id * block_size >= old_size {
                (*block_id, RestoreAction::DropTruncated)
            } else if current_versions
                .get(block_id)
                .map(|v| *v != block.version())
                .unwrap_or(false)
            {
                (*block_id, RestoreAction::DropSuperseded)
            } else {
                (*block_id, RestoreAction::Recommit)
            }
        })
        .collect()
}

/// Merge a failed snapshot back into the inode without clobbering writes
/// that landed after the snapshot was taken.  Idempotent: restoring an
/// already-restored set re-commits the same versions to the same state.
pub fn restore_dirty_blocks(
    cache: &BlockCache,
    inode: &mut Inode,
    old_file_version: i64,
    old_size: u64,
    block_size: u64,
    mut snapshot: BTreeMap<u64, DirtyBlock>,
) {
    let current_versions: BTreeMap<u64, i64> = inode
        .dirty_blocks()
        .iter()
        .map(|(id, d)| (*id, d.version()))
        .collect();

    let plan = restore_plan(
        old_file_version,
        inode.file_version(),
        old_size,
        block_size,
        &current_versions,
        &snapshot,
    );

    for (block_id, action) in plan {
        let Some(mut block) = snapshot.remove(&block_id) else {
            continue;
        };
        match action {
            RestoreAction::Recommit => {
                debug!(
                    "Restore block {:x}[{}.{}]",
                    inode.file_id(),
                    block_id,
                    block.version()
                );
                if let Err(e) = inode.commit_dirty_block(cache, block) {
                    // Only a non-dirty snapshot entry can get here; there is
                    // nothing to preserve for it.
                    warn!(
                        "Restore commit of block {:x}[{}] failed: {}",
                        inode.file_id(),
                        block_id,
                        e
                    );
                }
            }
            RestoreAction::DropTruncated | RestoreAction::DropSuperseded => {
                debug!(
                    "Restore drops block {:x}[{}.{}]: {:?}",
                    inode.file_id(),
                    block_id,
                    block.version(),
                    action
                );
                block.evict_and_free(cache, inode.file_id(), old_file_version);
            }
        }
    }
}

/// fsync an inode by path: flush its dirty blocks to the staging cache,
/// replicate blocks and manifest to the RGs in snapshot order, publish the
/// metadata update, and enqueue the displaced versions for vacuuming.
///
/// On replication failure the dirty set and replaced ledger are restored,
/// so the file stays open and writable and a retry will converge.
pub fn fsync_ex(gateway: &Gateway, path: &str) -> Result<()> {
    let (inode_arc, parent_id, parent_name) = gateway.namespace().resolve_with_parent(path)?;

    let waiter = Arc::new(Semaphore::new(0));
    let first_in_line;
    let mut rctx;
    let vctx;
    let old_file_version;
    let old_size;

    {
        let mut inode = inode_arc.write().unwrap();

        if inode.itype() == InodeType::Dir {
            return Ok(());
        }
        let has_dirty = inode.dirty_blocks().values().any(|d| d.dirty());
        if !has_dirty && inode.replaced_blocks().is_empty() {
            return Ok(());
        }

        old_file_version = inode.file_version();
        old_size = inode.size();

        let blocks = inode.extract_modified();
        rctx = ReplicaContext::new(path, &inode, blocks, parent_id, &parent_name);
        vctx = if inode.replaced_blocks().is_empty() {
            None
        } else {
            Some(VacuumContext::new(path, &inode))
        };

        if !inode.sync_running() && inode.sync_queue_len() == 0 {
            first_in_line = true;
            inode.set_sync_running(true);
        } else {
            first_in_line = false;
            inode.sync_queue_push(Arc::clone(&waiter));
        }

        // The snapshot owns the dirty set and the garbage now; the inode
        // starts over with an empty dirty map, and subsequent manifest
        // refreshes may overwrite the (clean) manifest blocks.
        inode.replace_dirty_blocks(gateway.cache());
        inode.clear_replaced_blocks();
        inode.manifest_mut().clear_dirty_flags();
    }

    if !first_in_line {
        waiter.wait();
    }

    let replicated = replication::replicate(gateway.cache(), gateway.rg(), &mut rctx);

    let mut inode = inode_arc.write().unwrap();

    let result = match replicated {
        Ok(()) => {
            let (mtime_sec, mtime_nsec) = rctx.manifest().modtime();
            inode.set_old_manifest_modtime((mtime_sec, mtime_nsec));
            debug!(
                "Replicated {}",
                crate::network::url::public_manifest_url(
                    &gateway.config().public_url,
                    &gateway.config().volume,
                    path,
                    rctx.file_version(),
                    mtime_sec,
                    mtime_nsec,
                )
            );
            publish_metadata(gateway, path, &mut inode, &rctx);

            if let Some(ctx) = vctx {
                if let Err(e) = gateway.vacuumer().enqueue(ctx) {
                    warn!("Vacuum enqueue for {} failed: {}", path, e);
                }
            }
            Ok(())
        }
        Err(e) => {
            error!(
                "Replication of {:x}.{} failed: {}",
                rctx.file_id(),
                rctx.file_version(),
                e
            );

            let snapshot = rctx.take_blocks();
            restore_dirty_blocks(
                gateway.cache(),
                &mut inode,
                old_file_version,
                old_size,
                gateway.block_size(),
                snapshot,
            );
            if let Some(ctx) = &vctx {
                ctx.restore(&mut inode);
            }

            Err(Error::Io(std::io::Error::other(format!(
                "replication failed: {}",
                e
            ))))
        }
    };

    // Hand the running slot to the next fsync in line
    if let Some(next) = inode.sync_queue_pop() {
        next.post();
    } else {
        inode.set_sync_running(false);
    }

    result
}

/// Publish the replicated snapshot's metadata to the MS.
///
/// A stale-version rejection gets one refresh-and-retry; any persistent
/// failure leaves the inode marked metadata-stale for the next read to
/// revalidate.  Replicated data is durable either way.
fn publish_metadata(gateway: &Gateway, path: &str, inode: &mut Inode, rctx: &ReplicaContext) {
    let mut entry = rctx.inode_data().clone();
    entry.write_nonce = inode.write_nonce();

    match gateway.ms().update(path, &entry) {
        Ok(updated) => {
            inode.note_published(updated.write_nonce, updated.generation);
        }
        Err(Error::StaleVersion(_)) => match gateway.ms().lookup(path) {
            Ok(fresh) => {
                entry.write_nonce = fresh.write_nonce;
                match gateway.ms().update(path, &entry) {
                    Ok(updated) => {
                        inode.note_published(updated.write_nonce, updated.generation);
                    }
                    Err(e) => {
                        warn!("Publish of {} failed after refresh: {}", path, e);
                        inode.set_metadata_stale(true);
                    }
                }
            }
            Err(e) => {
                warn!("Metadata refresh of {} failed: {}", path, e);
                inode.set_metadata_stale(true);
            }
        },
        Err(e) => {
            warn!("Publish of {} failed: {}", path, e);
            inode.set_metadata_stale(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_of(blocks: &[(u64, i64)]) -> BTreeMap<u64, DirtyBlock> {
        blocks
            .iter()
            .map(|(id, v)| (*id, DirtyBlock::new_dirty(*id, *v, vec![*id as u8; 16])))
            .collect()
    }

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();

        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let t = std::thread::spawn(move || {
            sem2.wait();
        });
        sem.post();
        t.join().unwrap();
    }

    #[test]
    fn test_restore_plan_recommits_unchanged() {
        let snapshot = snapshot_of(&[(0, 1), (1, 2)]);
        let plan = restore_plan(1, 1, 8192, 4096, &BTreeMap::new(), &snapshot);
        assert!(plan
            .iter()
            .all(|(_, action)| *action == RestoreAction::Recommit));
    }

    #[test]
    fn test_restore_plan_drops_truncated() {
        // File was reversioned and shrunk to one block (old size 8192)
        let snapshot = snapshot_of(&[(0, 1), (2, 1)]);
        let plan = restore_plan(1, 2, 8192, 4096, &BTreeMap::new(), &snapshot);

        let by_id: BTreeMap<u64, RestoreAction> = plan.into_iter().collect();
        assert_eq!(by_id[&0], RestoreAction::Recommit);
        assert_eq!(by_id[&2], RestoreAction::DropTruncated);
    }

    #[test]
    fn test_restore_plan_drops_superseded() {
        let snapshot = snapshot_of(&[(0, 1), (1, 1)]);
        let mut current = BTreeMap::new();
        current.insert(1u64, 5i64);

        let plan = restore_plan(1, 1, 8192, 4096, &current, &snapshot);
        let by_id: BTreeMap<u64, RestoreAction> = plan.into_iter().collect();
        assert_eq!(by_id[&0], RestoreAction::Recommit);
        assert_eq!(by_id[&1], RestoreAction::DropSuperseded);
    }

    #[test]
    fn test_restore_plan_same_version_not_superseded() {
        // A same-version entry in the live map means a prior restore pass
        // already ran; classifying it as superseded would drop the write
        let snapshot = snapshot_of(&[(3, 7)]);
        let mut current = BTreeMap::new();
        current.insert(3u64, 7i64);

        let plan = restore_plan(1, 1, 1 << 20, 4096, &current, &snapshot);
        assert_eq!(plan, vec![(3, RestoreAction::Recommit)]);
    }

    #[test]
    fn test_restore_idempotent() {
        use crate::fs::inode::InodeType;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let cache = BlockCache::new(dir.path().to_path_buf(), 1).unwrap();
        let mut inode = Inode::new(InodeType::File, "x", 1, 10, 0, 0o644);
        inode.set_file_id(0x100);

        restore_dirty_blocks(&cache, &mut inode, 1, 8192, 4096, snapshot_of(&[(0, 1)]));
        let manifest_after_first = inode.manifest().clone();

        restore_dirty_blocks(&cache, &mut inode, 1, 8192, 4096, snapshot_of(&[(0, 1)]));
        assert_eq!(*inode.manifest(), manifest_after_first);
        assert_eq!(inode.dirty_blocks().len(), 1);
        // Re-restoring the same version must not ledger it as garbage
        assert!(inode.replaced_blocks().is_empty());
        cache.shutdown();
    }
}
