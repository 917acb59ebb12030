//! The process-wide gateway handle
//!
//! One `Gateway` owns every subsystem: the staging cache and its flush
//! pool, the vacuumer, the closure, the namespace, and handles to the MS
//! and RG collaborators.  It is created explicitly at startup and passed
//! to every entry point; nothing discovers it implicitly.

use std::sync::Arc;

use tracing::{info, warn};

use crate::closure::{disk_driver_factory, Closure, GatewayKeys};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::inode::Inode;
use crate::fs::path::Namespace;
use crate::fs::now_timespec;
use crate::ms::{MdEntry, MsClient, MD_ENTRY_DIR};
use crate::replication::RgClient;
use crate::storage::cache::BlockCache;
use crate::vacuum::Vacuumer;

pub struct Gateway {
    config: Config,
    block_size: u64,
    keys: GatewayKeys,
    ms: Arc<dyn MsClient>,
    rg: Arc<dyn RgClient>,
    cache: Arc<BlockCache>,
    vacuumer: Vacuumer,
    closure: Closure,
    ns: Namespace,
}

impl Gateway {
    /// Bring the gateway up: keys, staging cache, vacuumer, closure, and
    /// the volume root.
    pub fn init(config: Config, ms: Arc<dyn MsClient>, rg: Arc<dyn RgClient>) -> Result<Self> {
        let volume = ms.volume();
        if volume.block_size == 0 {
            return Err(Error::Config("volume block size is zero".to_string()));
        }

        let keys = GatewayKeys::load_or_generate(&config.private_key_path)?;
        let cache = Arc::new(BlockCache::new(
            config.staging_dir(),
            config.num_replica_threads,
        )?);
        let vacuumer = Vacuumer::new(Arc::clone(&rg));
        let closure = Closure::new(
            disk_driver_factory(config.data_root.join("driver-objects")),
            false,
        );

        let root = Self::bootstrap_root(&config, ms.as_ref(), volume.volume_id)?;
        let ns = Namespace::new(root);

        let gateway = Self {
            block_size: volume.block_size,
            config,
            keys,
            ms,
            rg,
            cache,
            vacuumer,
            closure,
            ns,
        };

        gateway.load_cached_closure();
        info!(
            "Gateway {} up on volume {} (block size {})",
            gateway.config.gateway_id, volume.name, volume.block_size
        );
        Ok(gateway)
    }

    /// Fetch or register the volume root directory
    fn bootstrap_root(config: &Config, ms: &dyn MsClient, volume_id: u64) -> Result<Inode> {
        match ms.lookup("/") {
            Ok(entry) => Ok(Inode::from_entry(&entry)),
            Err(Error::NotFound(_)) => {
                let now = now_timespec();
                let entry = MdEntry {
                    entry_type: MD_ENTRY_DIR,
                    name: "/".to_string(),
                    volume: volume_id,
                    coordinator: config.gateway_id,
                    mode: 0o755,
                    version: 1,
                    ctime_sec: now.0,
                    ctime_nsec: now.1,
                    mtime_sec: now.0,
                    mtime_nsec: now.1,
                    ..Default::default()
                };
                match ms.create("/", entry) {
                    Ok(created) => Ok(Inode::from_entry(&created)),
                    // A peer registered the root first; take theirs
                    Err(Error::AlreadyExists(_)) => Ok(Inode::from_entry(&ms.lookup("/")?)),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Load the last good closure bundle from the cache file, if both it
    /// and the MS public key are available
    fn load_cached_closure(&self) {
        let path = self.config.closure_cache_path();
        if !path.exists() {
            return;
        }
        let Ok(doc) = std::fs::read_to_string(&path) else {
            warn!("Unreadable closure cache at {:?}", path);
            return;
        };
        let ms_public = match std::fs::read_to_string(&self.config.ms_public_key_path)
            .map_err(Error::Io)
            .and_then(|b64| crate::closure::parse_public_key(&b64))
        {
            Ok(key) => key,
            Err(e) => {
                warn!("No MS public key; skipping cached closure: {}", e);
                return;
            }
        };
        if let Err(e) = self.closure.init(&doc, &self.keys, &ms_public) {
            warn!("Cached closure rejected: {}", e);
        }
    }

    /// Verify, load, and persist a new closure bundle
    pub fn reload_closure(&self, doc: &str) -> Result<()> {
        let b64 = std::fs::read_to_string(&self.config.ms_public_key_path)?;
        let ms_public = crate::closure::parse_public_key(&b64)?;
        self.closure.reload(doc, &self.keys, &ms_public)?;
        std::fs::write(self.config.closure_cache_path(), doc)?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.config.gateway_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn keys(&self) -> &GatewayKeys {
        &self.keys
    }

    pub fn ms(&self) -> &dyn MsClient {
        self.ms.as_ref()
    }

    pub fn rg(&self) -> &dyn RgClient {
        self.rg.as_ref()
    }

    pub fn cache(&self) -> &BlockCache {
        self.cache.as_ref()
    }

    pub fn vacuumer(&self) -> &Vacuumer {
        &self.vacuumer
    }

    pub fn closure(&self) -> &Closure {
        &self.closure
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Attach an inode for a path, fetching its metadata from the MS if it
    /// is not already resident.  Revalidates stale resident metadata.
    pub fn resolve(&self, path: &str) -> Result<Arc<std::sync::RwLock<Inode>>> {
        if let Some(arc) = self.ns.get(path) {
            let stale = arc.read().unwrap().read_stale();
            if stale {
                match self.ms.lookup(path) {
                    Ok(fresh) => {
                        let mut inode = arc.write().unwrap();
                        if let Err(e) = inode.import(&fresh) {
                            // A rename/reversion happened elsewhere; this
                            // inode must be re-opened to reconcile.
                            warn!("Revalidation of {} rejected: {}", path, e);
                            inode.set_metadata_stale(true);
                        }
                    }
                    Err(Error::NotFound(_)) => {
                        return Err(Error::NotFound(path.to_string()));
                    }
                    Err(e) => {
                        warn!("Revalidation of {} failed: {}", path, e);
                    }
                }
            }
            return Ok(arc);
        }

        // Not resident: make sure the ancestry is attached first
        let normalized = crate::fs::path::normalize(path);
        let parent = crate::fs::path::parent_of(&normalized);
        if parent != normalized && !self.ns.contains(&parent) {
            self.resolve(&parent)?;
        }

        let entry = self.ms.lookup(&normalized)?;
        let inode = Inode::from_entry(&entry);
        match self.ns.insert(&normalized, inode) {
            Ok(arc) => Ok(arc),
            // Raced another resolver; theirs is as good as ours
            Err(Error::AlreadyExists(_)) => self
                .ns
                .get(&normalized)
                .ok_or_else(|| Error::NotFound(normalized.clone())),
            Err(e) => Err(e),
        }
    }

    /// Become (or learn) the coordinator of a file: MS-side CAS on the
    /// coordinator field.  Returns the file's coordinator afterwards,
    /// which equals our ID exactly when the takeover happened.
    pub fn chcoord(&self, path: &str) -> Result<u64> {
        let entry = self.ms.lookup(path)?;

        if entry.coordinator == self.id() {
            self.note_coordinator(path, self.id());
            return Ok(self.id());
        }

        match self.ms.coordinate(path, entry.coordinator, self.id()) {
            Ok(updated) => {
                info!(
                    "Took over coordination of {} from {}",
                    path, entry.coordinator
                );
                self.note_coordinator(path, self.id());
                if let Some(arc) = self.ns.get(path) {
                    arc.write().unwrap().note_published(
                        updated.write_nonce,
                        updated.generation,
                    );
                }
                Ok(self.id())
            }
            Err(Error::CoordinatorChanged(incumbent)) => {
                self.note_coordinator(path, incumbent);
                Ok(incumbent)
            }
            Err(e) => Err(e),
        }
    }

    fn note_coordinator(&self, path: &str, coordinator: u64) {
        if let Some(arc) = self.ns.get(path) {
            arc.write().unwrap().set_coordinator(coordinator);
        }
    }

    /// Tear the gateway down: drain the vacuumer, stop the flush pool,
    /// shut the driver down
    pub fn shutdown(&self) {
        self.vacuumer.shutdown();
        self.cache.shutdown();
        self.closure.shutdown();
        info!("Gateway {} down", self.config.gateway_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ms::MemMsClient;
    use crate::replication::MemRgClient;
    use tempfile::TempDir;

    pub struct TestEnv {
        pub gateway: Gateway,
        pub ms: Arc<MemMsClient>,
        pub rg: Arc<MemRgClient>,
        pub dir: TempDir,
    }

    /// A gateway wired to in-memory MS/RG doubles, rooted in a tempdir
    pub fn test_env(gateway_id: u64) -> TestEnv {
        let dir = TempDir::new().unwrap();
        let ms = Arc::new(MemMsClient::new(1, 4096));
        let rg = Arc::new(MemRgClient::new());

        let config = Config {
            volume: "test".to_string(),
            gateway_id,
            data_root: dir.path().to_path_buf(),
            private_key_path: dir.path().join("gateway.key"),
            ms_public_key_path: dir.path().join("ms.pub"),
            num_replica_threads: 2,
            ..Default::default()
        };

        let gateway = Gateway::init(
            config,
            Arc::clone(&ms) as Arc<dyn MsClient>,
            Arc::clone(&rg) as Arc<dyn RgClient>,
        )
        .unwrap();

        TestEnv {
            gateway,
            ms,
            rg,
            dir,
        }
    }

    #[test]
    fn test_init_bootstraps_root() {
        let env = test_env(10);
        assert!(env.gateway.namespace().contains("/"));
        assert!(env.ms.generation_of("/").is_some());
        assert_eq!(env.gateway.block_size(), 4096);
        env.gateway.shutdown();
    }

    #[test]
    fn test_chcoord_takes_over() {
        let env = test_env(10);
        env.ms
            .create("/x", MdEntry {
                entry_type: crate::ms::MD_ENTRY_FILE,
                name: "x".to_string(),
                coordinator: 20,
                ..Default::default()
            })
            .unwrap();

        let coordinator = env.gateway.chcoord("/x").unwrap();
        assert_eq!(coordinator, 10);
        assert_eq!(env.ms.lookup("/x").unwrap().coordinator, 10);
        env.gateway.shutdown();
    }

    #[test]
    fn test_resolve_attaches_ancestry() {
        let env = test_env(10);
        env.ms
            .create("/a", MdEntry {
                entry_type: MD_ENTRY_DIR,
                name: "a".to_string(),
                coordinator: 10,
                mode: 0o755,
                ..Default::default()
            })
            .unwrap();
        env.ms
            .create("/a/b", MdEntry {
                entry_type: crate::ms::MD_ENTRY_FILE,
                name: "b".to_string(),
                coordinator: 10,
                ..Default::default()
            })
            .unwrap();

        let arc = env.gateway.resolve("/a/b").unwrap();
        assert_eq!(arc.read().unwrap().name(), "b");
        assert!(env.gateway.namespace().contains("/a"));
        env.gateway.shutdown();
    }
}
