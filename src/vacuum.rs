//! Background vacuumer
//!
//! After a successful fsync, the block versions the sync displaced still
//! exist on the RGs under their old names.  The vacuumer deletes them
//! asynchronously.  Contexts that cannot be finished are retained; a new
//! coordinator is expected to re-vacuum on its next fsync.  If both the
//! coordinator and the vacuumer die before acknowledgement, the replicas
//! leak (reclaiming those is deferred to an offline fsck).

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fs::inode::Inode;
use crate::manifest::Manifest;
use crate::replication::RgClient;

/// Delete attempts per block before a context is retained
const MAX_DELETE_ATTEMPTS: u32 = 3;

/// Backoff between delete attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// One fsync's worth of garbage: the replaced-block ledger snapshot
pub struct VacuumContext {
    fs_path: String,
    file_id: u64,
    file_version: i64,
    replaced: Manifest,
}

impl VacuumContext {
    /// Snapshot an inode's replaced-block ledger.
    /// The caller must hold the inode's write lock.
    pub fn new(fs_path: &str, inode: &Inode) -> Self {
        Self {
            fs_path: fs_path.to_string(),
            file_id: inode.file_id(),
            file_version: inode.file_version(),
            replaced: inode.replaced_blocks().clone(),
        }
    }

    pub fn fs_path(&self) -> &str {
        &self.fs_path
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn replaced(&self) -> &Manifest {
        &self.replaced
    }

    /// Put this context's garbage back into the inode's ledger
    /// (failed replication; the fsync never happened)
    pub fn restore(&self, inode: &mut Inode) {
        inode.restore_replaced_blocks(&self.replaced);
    }
}

/// Background worker that reclaims replaced replica blocks
pub struct Vacuumer {
    jobs: Mutex<Option<Sender<VacuumContext>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    retained: Arc<Mutex<Vec<VacuumContext>>>,
}

impl Vacuumer {
    /// Start the vacuum worker
    pub fn new(rg: Arc<dyn RgClient>) -> Self {
        let (tx, rx) = mpsc::channel::<VacuumContext>();
        let retained = Arc::new(Mutex::new(Vec::new()));
        let retained_for_worker = Arc::clone(&retained);

        let worker = thread::spawn(move || {
            while let Ok(ctx) = rx.recv() {
                if let Some(leftover) = vacuum_one(rg.as_ref(), ctx) {
                    warn!(
                        "Vacuum of {:x}.{} incomplete; retaining {} block(s) for the next coordinator",
                        leftover.file_id,
                        leftover.file_version,
                        leftover.replaced.block_count()
                    );
                    retained_for_worker.lock().unwrap().push(leftover);
                }
            }
        });

        Self {
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            retained,
        }
    }

    /// Hand a context to the worker
    pub fn enqueue(&self, ctx: VacuumContext) -> Result<()> {
        let guard = self.jobs.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(ctx).map_err(|_| Error::Cancelled),
            None => Err(Error::Cancelled),
        }
    }

    /// Number of contexts that could not be completed (test hook)
    pub fn retained_count(&self) -> usize {
        self.retained.lock().unwrap().len()
    }

    /// Stop the worker after draining queued contexts
    pub fn shutdown(&self) {
        self.jobs.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

/// Process one context.  Returns a leftover context holding the blocks
/// that could not be deleted, if any.
fn vacuum_one(rg: &dyn RgClient, ctx: VacuumContext) -> Option<VacuumContext> {
    let mut leftover = ctx.replaced.clone();
    leftover.clear();

    for (block_id, info) in ctx.replaced.iter() {
        let mut deleted = false;
        for attempt in 1..=MAX_DELETE_ATTEMPTS {
            match rg.delete_block(ctx.file_id, ctx.file_version, *block_id, info.version) {
                Ok(()) => {
                    debug!(
                        "Vacuumed block {:x}.{}[{}.{}]",
                        ctx.file_id, ctx.file_version, block_id, info.version
                    );
                    deleted = true;
                    break;
                }
                Err(e) => {
                    debug!(
                        "Vacuum delete {:x}.{}[{}.{}] attempt {} failed: {}",
                        ctx.file_id, ctx.file_version, block_id, info.version, attempt, e
                    );
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
        if !deleted {
            let _ = leftover.put_block(info.clone(), true);
        }
    }

    if leftover.is_empty() {
        None
    } else {
        Some(VacuumContext {
            fs_path: ctx.fs_path,
            file_id: ctx.file_id,
            file_version: ctx.file_version,
            replaced: leftover,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::InodeType;
    use crate::manifest::BlockInfo;
    use crate::replication::MemRgClient;

    fn inode_with_garbage() -> (Inode, Arc<MemRgClient>) {
        let rg = Arc::new(MemRgClient::new());
        rg.put_block(0x100, 1, 0, 1, vec![1u8; 8]).unwrap();
        rg.put_block(0x100, 1, 1, 1, vec![2u8; 8]).unwrap();

        let mut inode = Inode::new(InodeType::File, "x", 1, 10, 0, 0o644);
        inode.set_file_id(0x100);
        (inode, rg)
    }

    #[test]
    fn test_vacuum_deletes_replaced_blocks() {
        let (mut inode, rg) = inode_with_garbage();
        let mut garbage = Manifest::new(1, 10, 0x100, 1);
        garbage.put_block(BlockInfo::new(0, 1, vec![0; 4]), true).unwrap();
        garbage.put_block(BlockInfo::new(1, 1, vec![0; 4]), true).unwrap();
        inode.restore_replaced_blocks(&garbage);

        let ctx = VacuumContext::new("/x", &inode);
        let vacuumer = Vacuumer::new(Arc::clone(&rg) as Arc<dyn RgClient>);
        vacuumer.enqueue(ctx).unwrap();
        vacuumer.shutdown();

        assert_eq!(rg.block_count(), 0);
        assert_eq!(vacuumer.retained_count(), 0);
    }

    #[test]
    fn test_context_restore_is_additive() {
        let (mut inode, _rg) = inode_with_garbage();
        let mut garbage = Manifest::new(1, 10, 0x100, 1);
        garbage.put_block(BlockInfo::new(0, 1, vec![0; 4]), true).unwrap();
        inode.restore_replaced_blocks(&garbage);

        let ctx = VacuumContext::new("/x", &inode);
        inode.clear_replaced_blocks();

        // A newer displaced version got ledgered before the restore ran
        let mut newer = Manifest::new(1, 10, 0x100, 1);
        newer.put_block(BlockInfo::new(0, 2, vec![0; 4]), true).unwrap();
        inode.restore_replaced_blocks(&newer);

        ctx.restore(&mut inode);
        // The newer entry wins; the snapshot does not clobber it
        assert_eq!(inode.replaced_blocks().lookup(0).unwrap().version, 2);
    }
}
