//! Hot-reloadable storage driver closures
//!
//! A closure bundle delivers the storage driver a gateway runs: its code,
//! plaintext config, and sealed secrets, signed by the MS.  The bundle is
//! a JSON document whose `config` and `driver` fields are base64; the
//! `secrets` field is base64 ciphertext sealed to the gateway key and
//! opened with the X25519 shared secret against the MS public key.
//!
//! Reload swaps the driver behind a writer lock: the old driver is shut
//! down, the new one initialized, and on any failure the old state stays.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Symbols every complete driver provides
pub const DRIVER_SYMBOLS: &[&str] = &["get", "put", "delete", "stat", "list"];

/// Metadata about a stored object, as a driver reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverStat {
    pub name: String,
    pub size: u64,
}

/// The operation set a storage driver implements.
///
/// Implementations must be internally synchronized; the closure holds a
/// read lock over calls only to fence reloads.
pub trait StorageDriver: Send + Sync {
    fn get(&self, name: &str) -> Result<Vec<u8>>;
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
    fn stat(&self, name: &str) -> Result<DriverStat>;
    fn list(&self) -> Result<Vec<String>>;

    /// Symbols this driver actually provides
    fn symbols(&self) -> Vec<String> {
        DRIVER_SYMBOLS.iter().map(|s| s.to_string()).collect()
    }

    /// Called under the writer lock before the driver is dropped
    fn shutdown(&self) {}
}

/// Builds a driver instance out of a parsed bundle.  The gateway supplies
/// this; the default builds the on-disk driver.
pub type DriverFactory =
    Arc<dyn Fn(&ClosureBundle) -> Result<Arc<dyn StorageDriver>> + Send + Sync>;

/// X25519 identity of this gateway.
///
/// Only the secret half is held; the public half is derived on demand,
/// since its one consumer is the MS sealing bundle secrets to us.
pub struct GatewayKeys {
    secret: StaticSecret,
}

impl GatewayKeys {
    /// Load the gateway identity, minting and persisting a fresh one on
    /// first boot.  Bundles are sealed to this key, so it has to exist
    /// before the gateway can accept a closure.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(b64) => Self::decode(b64.trim()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                let keys = Self {
                    secret: StaticSecret::from(key),
                };
                keys.persist(path)?;
                info!("Minted gateway identity at {:?}", path);
                Ok(keys)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Load an existing identity from its key file (32 bytes, base64)
    pub fn load(path: &Path) -> Result<Self> {
        let b64 = std::fs::read_to_string(path)?;
        Self::decode(b64.trim())
    }

    fn decode(b64: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(b64)
            .map_err(|e| Error::Corrupt(format!("private key: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Corrupt("private key must be 32 bytes".to_string()))?;
        Ok(Self {
            secret: StaticSecret::from(key),
        })
    }

    /// Write the key file out.  Created owner-only from the start; the
    /// secret half must never be readable by anyone else, even briefly.
    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let b64 = BASE64.encode(self.secret.to_bytes());

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(b64.as_bytes())?;
        }
        #[cfg(not(unix))]
        std::fs::write(path, &b64)?;

        Ok(())
    }

    /// The public half, for the MS to seal bundles against
    pub fn public(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public().as_bytes())
    }
}

/// Parse a base64 public key
pub fn parse_public_key(b64: &str) -> Result<PublicKey> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Corrupt(format!("public key: {}", e)))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Corrupt("public key must be 32 bytes".to_string()))?;
    Ok(PublicKey::from(arr))
}

/// Seal a secrets table to a gateway: X25519(ms_secret, gateway_public)
/// keyed ChaCha20-Poly1305, random nonce prepended.  This is the MS side;
/// it lives here so tests (and the MS double) can build bundles.
pub fn seal_secrets(
    ms_secret: &StaticSecret,
    gateway_public: &PublicKey,
    secrets: &BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    let shared = ms_secret.diffie_hellman(gateway_public);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()));

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = serde_json::to_vec(secrets)
        .map_err(|e| Error::InvalidArgument(format!("secrets: {}", e)))?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|_| Error::Corrupt("secret sealing failed".to_string()))?;

    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed secrets table with the gateway key and the MS public key.
/// Authentication doubles as verification that the MS sealed it.
fn open_secrets(
    gateway_secret: &StaticSecret,
    ms_public: &PublicKey,
    sealed: &[u8],
) -> Result<BTreeMap<String, String>> {
    if sealed.len() < 12 {
        return Err(Error::Corrupt("sealed secrets too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(12);

    let shared = gateway_secret.diffie_hellman(ms_public);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::Corrupt("secret verification failed".to_string()))?;

    serde_json::from_slice(&plaintext).map_err(|e| Error::Corrupt(format!("secrets: {}", e)))
}

/// The bundle document as delivered
#[derive(Debug, Serialize, Deserialize)]
struct BundleDoc {
    /// base64 of a JSON string-to-string map
    config: String,
    /// base64 of ciphertext (empty string: no secrets)
    #[serde(default)]
    secrets: String,
    /// base64 of opaque driver code
    driver: String,
    /// names the driver is expected to provide
    #[serde(default)]
    symbols: Vec<String>,
}

/// A parsed, verified closure bundle
#[derive(Debug, Clone)]
pub struct ClosureBundle {
    pub config: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub driver: Vec<u8>,
    pub symbols: Vec<String>,
}

impl ClosureBundle {
    /// Parse and verify a bundle document
    pub fn parse(doc: &str, keys: &GatewayKeys, ms_public: &PublicKey) -> Result<Self> {
        let doc: BundleDoc =
            serde_json::from_str(doc).map_err(|e| Error::Corrupt(format!("bundle: {}", e)))?;

        let config_json = BASE64
            .decode(&doc.config)
            .map_err(|e| Error::Corrupt(format!("bundle config: {}", e)))?;
        let config: BTreeMap<String, String> = serde_json::from_slice(&config_json)
            .map_err(|e| Error::Corrupt(format!("bundle config: {}", e)))?;

        let secrets = if doc.secrets.is_empty() {
            BTreeMap::new()
        } else {
            let sealed = BASE64
                .decode(&doc.secrets)
                .map_err(|e| Error::Corrupt(format!("bundle secrets: {}", e)))?;
            open_secrets(&keys.secret, ms_public, &sealed)?
        };

        let driver = BASE64
            .decode(&doc.driver)
            .map_err(|e| Error::Corrupt(format!("bundle driver: {}", e)))?;

        Ok(Self {
            config,
            secrets,
            driver,
            symbols: doc.symbols,
        })
    }

    /// Render a bundle document (the MS side; used by tests)
    pub fn render(
        config: &BTreeMap<String, String>,
        sealed_secrets: &[u8],
        driver: &[u8],
        symbols: &[&str],
    ) -> String {
        let doc = BundleDoc {
            config: BASE64.encode(serde_json::to_vec(config).unwrap_or_default()),
            secrets: if sealed_secrets.is_empty() {
                String::new()
            } else {
                BASE64.encode(sealed_secrets)
            },
            driver: BASE64.encode(driver),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        };
        serde_json::to_string(&doc).unwrap_or_default()
    }
}

struct ClosureState {
    bundle: ClosureBundle,
    driver: Arc<dyn StorageDriver>,
}

/// The loaded driver, swappable at runtime
pub struct Closure {
    state: RwLock<Option<ClosureState>>,
    factory: DriverFactory,
    /// Tolerate drivers that lack some expected symbols
    ignore_stubs: bool,
}

impl Closure {
    pub fn new(factory: DriverFactory, ignore_stubs: bool) -> Self {
        Self {
            state: RwLock::new(None),
            factory,
            ignore_stubs,
        }
    }

    /// Load a bundle for the first time
    pub fn init(&self, doc: &str, keys: &GatewayKeys, ms_public: &PublicKey) -> Result<()> {
        let bundle = ClosureBundle::parse(doc, keys, ms_public)?;
        let driver = self.instantiate(&bundle)?;

        let mut state = self.state.write().unwrap();
        if state.is_some() {
            return Err(Error::AlreadyExists("closure already loaded".to_string()));
        }
        *state = Some(ClosureState { bundle, driver });
        Ok(())
    }

    /// Atomically swap in a new bundle.  The old driver is shut down only
    /// once the new one initialized; on failure the old state is retained.
    pub fn reload(&self, doc: &str, keys: &GatewayKeys, ms_public: &PublicKey) -> Result<()> {
        let bundle = ClosureBundle::parse(doc, keys, ms_public)?;
        let driver = self.instantiate(&bundle)?;

        let mut state = self.state.write().unwrap();
        if let Some(old) = state.take() {
            old.driver.shutdown();
        }
        *state = Some(ClosureState { bundle, driver });
        info!("Closure reloaded ({} config key(s))", state.as_ref().unwrap().bundle.config.len());
        Ok(())
    }

    fn instantiate(&self, bundle: &ClosureBundle) -> Result<Arc<dyn StorageDriver>> {
        let driver = (self.factory)(bundle)?;

        let provided = driver.symbols();
        let missing: Vec<&String> = bundle
            .symbols
            .iter()
            .filter(|s| !provided.contains(s))
            .collect();
        if !missing.is_empty() {
            if !self.ignore_stubs {
                return Err(Error::InvalidArgument(format!(
                    "driver lacks symbols: {:?}",
                    missing
                )));
            }
            warn!("Driver lacks symbols {:?}; continuing with stubs", missing);
        }
        Ok(driver)
    }

    /// Run an operation against the loaded driver under the read lock
    pub fn with_driver<T>(&self, f: impl FnOnce(&dyn StorageDriver) -> Result<T>) -> Result<T> {
        let state = self.state.read().unwrap();
        match state.as_ref() {
            Some(s) => f(s.driver.as_ref()),
            None => Err(Error::InvalidArgument("no driver loaded".to_string())),
        }
    }

    /// Plaintext config lookup
    pub fn get_config(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        state
            .as_ref()
            .and_then(|s| s.bundle.config.get(key).cloned())
    }

    /// Secret lookup
    pub fn get_secret(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        state
            .as_ref()
            .and_then(|s| s.bundle.secrets.get(key).cloned())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().unwrap().is_some()
    }

    /// Shut the driver down and unload the bundle
    pub fn shutdown(&self) {
        let mut state = self.state.write().unwrap();
        if let Some(old) = state.take() {
            old.driver.shutdown();
        }
    }
}

/// On-disk driver: objects are files under a root directory.  The default
/// driver when a bundle names no other backend.
pub struct DiskDriver {
    root: std::path::PathBuf,
}

impl DiskDriver {
    pub fn new(root: std::path::PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, name: &str) -> Result<std::path::PathBuf> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(Error::InvalidArgument(format!("object name {:?}", name)));
        }
        Ok(self.root.join(name))
    }
}

impl StorageDriver for DiskDriver {
    fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(name)?;
        std::fs::read(&path).map_err(|_| Error::NotFound(name.to_string()))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(name)?;
        std::fs::write(&path, data)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        std::fs::remove_file(&path).map_err(|_| Error::NotFound(name.to_string()))
    }

    fn stat(&self, name: &str) -> Result<DriverStat> {
        let path = self.object_path(name)?;
        let meta = std::fs::metadata(&path).map_err(|_| Error::NotFound(name.to_string()))?;
        Ok(DriverStat {
            name: name.to_string(),
            size: meta.len(),
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Driver factory producing [`DiskDriver`]s rooted per the bundle's
/// `root` config key (or a supplied default)
pub fn disk_driver_factory(default_root: std::path::PathBuf) -> DriverFactory {
    Arc::new(move |bundle: &ClosureBundle| {
        let root = bundle
            .config
            .get("root")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| default_root.clone());
        Ok(Arc::new(DiskDriver::new(root)?) as Arc<dyn StorageDriver>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_keys(dir: &tempfile::TempDir) -> GatewayKeys {
        GatewayKeys::load_or_generate(&dir.path().join("gw.key")).unwrap()
    }

    fn test_bundle(keys: &GatewayKeys, driver_root: &Path) -> (String, PublicKey) {
        let ms_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ms_public = PublicKey::from(&ms_secret);

        let mut config = BTreeMap::new();
        config.insert("root".to_string(), driver_root.display().to_string());

        let mut secrets = BTreeMap::new();
        secrets.insert("api_key".to_string(), "hunter2".to_string());
        let sealed = seal_secrets(&ms_secret, &keys.public(), &secrets).unwrap();

        let doc = ClosureBundle::render(&config, &sealed, b"builtin:disk", DRIVER_SYMBOLS);
        (doc, ms_public)
    }

    #[test]
    fn test_keys_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gw.key");

        let keys = GatewayKeys::load_or_generate(&path).unwrap();
        let again = GatewayKeys::load(&path).unwrap();
        assert_eq!(keys.public_base64(), again.public_base64());

        let parsed = parse_public_key(&keys.public_base64()).unwrap();
        assert_eq!(parsed.as_bytes(), keys.public().as_bytes());
    }

    #[test]
    fn test_bundle_parse_and_secrets() {
        let dir = tempdir().unwrap();
        let keys = test_keys(&dir);
        let (doc, ms_public) = test_bundle(&keys, &dir.path().join("objects"));

        let closure = Closure::new(disk_driver_factory(dir.path().join("objects")), false);
        closure.init(&doc, &keys, &ms_public).unwrap();

        assert_eq!(closure.get_secret("api_key").unwrap(), "hunter2");
        assert!(closure.get_secret("nope").is_none());
        assert_eq!(
            closure.get_config("root").unwrap(),
            dir.path().join("objects").display().to_string()
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let dir = tempdir().unwrap();
        let keys = test_keys(&dir);
        let (doc, _ms_public) = test_bundle(&keys, dir.path());

        // Verifying against the wrong MS key must fail
        let impostor = PublicKey::from(&StaticSecret::random_from_rng(rand::rngs::OsRng));
        let closure = Closure::new(disk_driver_factory(dir.path().to_path_buf()), false);
        match closure.init(&doc, &keys, &impostor) {
            Err(Error::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got ok={}", other.is_ok()),
        }
        assert!(!closure.is_loaded());
    }

    #[test]
    fn test_driver_calls() {
        let dir = tempdir().unwrap();
        let keys = test_keys(&dir);
        let (doc, ms_public) = test_bundle(&keys, &dir.path().join("objects"));

        let closure = Closure::new(disk_driver_factory(dir.path().join("objects")), false);
        closure.init(&doc, &keys, &ms_public).unwrap();

        closure
            .with_driver(|d| d.put("blob", b"payload"))
            .unwrap();
        let data = closure.with_driver(|d| d.get("blob")).unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(closure.with_driver(|d| d.list()).unwrap(), vec!["blob"]);

        closure.with_driver(|d| d.delete("blob")).unwrap();
        assert!(closure.with_driver(|d| d.stat("blob")).is_err());
    }

    #[test]
    fn test_reload_keeps_old_on_failure() {
        let dir = tempdir().unwrap();
        let keys = test_keys(&dir);
        let (doc, ms_public) = test_bundle(&keys, &dir.path().join("objects"));

        let closure = Closure::new(disk_driver_factory(dir.path().join("objects")), false);
        closure.init(&doc, &keys, &ms_public).unwrap();

        assert!(closure.reload("not json", &keys, &ms_public).is_err());
        assert!(closure.is_loaded());
        assert!(closure.get_config("root").is_some());
    }

    #[test]
    fn test_missing_symbols() {
        struct StubDriver;
        impl StorageDriver for StubDriver {
            fn get(&self, _: &str) -> Result<Vec<u8>> {
                Err(Error::NotFound("stub".to_string()))
            }
            fn put(&self, _: &str, _: &[u8]) -> Result<()> {
                Ok(())
            }
            fn delete(&self, _: &str) -> Result<()> {
                Ok(())
            }
            fn stat(&self, _: &str) -> Result<DriverStat> {
                Err(Error::NotFound("stub".to_string()))
            }
            fn list(&self) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            fn symbols(&self) -> Vec<String> {
                vec!["get".to_string(), "put".to_string()]
            }
        }

        let dir = tempdir().unwrap();
        let keys = test_keys(&dir);
        let (doc, ms_public) = test_bundle(&keys, dir.path());
        let factory: DriverFactory =
            Arc::new(|_| Ok(Arc::new(StubDriver) as Arc<dyn StorageDriver>));

        let strict = Closure::new(Arc::clone(&factory), false);
        assert!(strict.init(&doc, &keys, &ms_public).is_err());

        let tolerant = Closure::new(factory, true);
        tolerant.init(&doc, &keys, &ms_public).unwrap();
        assert!(tolerant.is_loaded());
    }
}
