//! Configuration types for the User Gateway

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Gateway configuration record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Volume this gateway serves
    pub volume: String,

    /// Unique numeric gateway identifier within the volume
    pub gateway_id: u64,

    /// Human-readable gateway name (used in logs and MS registration)
    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,

    /// Metadata Service URL
    #[serde(default = "default_ms_url")]
    pub ms_url: String,

    /// Root directory for staged blocks and the closure cache
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Publicly-reachable URL of this gateway
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Path to the gateway's private key (base64, 32 bytes)
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,

    /// Path to the MS public key used to verify closure bundles
    #[serde(default = "default_ms_public_key_path")]
    pub ms_public_key_path: PathBuf,

    /// Log verbosity: 0 = info, 1 = debug, 2 = trace
    #[serde(default)]
    pub debug_level: u8,

    /// Number of threads in the replica flush pool
    #[serde(default = "default_num_replica_threads")]
    pub num_replica_threads: usize,

    /// How long cached read metadata stays fresh, in milliseconds
    #[serde(default = "default_read_freshness")]
    pub max_read_freshness_ms: u64,

    /// How long cached write metadata stays fresh, in milliseconds
    #[serde(default = "default_write_freshness")]
    pub max_write_freshness_ms: u64,
}

fn default_gateway_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "ug".to_string())
}

fn default_ms_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/var/lib/syndicate-ug")
}

fn default_public_url() -> String {
    "http://localhost:9600".to_string()
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("/etc/syndicate-ug/gateway.key")
}

fn default_ms_public_key_path() -> PathBuf {
    PathBuf::from("/etc/syndicate-ug/ms.pub")
}

fn default_num_replica_threads() -> usize {
    4
}

fn default_read_freshness() -> u64 {
    5000
}

fn default_write_freshness() -> u64 {
    0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            volume: "default".to_string(),
            gateway_id: 1,
            gateway_name: default_gateway_name(),
            ms_url: default_ms_url(),
            data_root: default_data_root(),
            public_url: default_public_url(),
            private_key_path: default_private_key_path(),
            ms_public_key_path: default_ms_public_key_path(),
            debug_level: 0,
            num_replica_threads: default_num_replica_threads(),
            max_read_freshness_ms: default_read_freshness(),
            max_write_freshness_ms: default_write_freshness(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the block staging tree path
    pub fn staging_dir(&self) -> PathBuf {
        self.data_root.join("staging")
    }

    /// Get the cached closure bundle path
    pub fn closure_cache_path(&self) -> PathBuf {
        self.data_root.join("closure.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.volume = "testvol".to_string();
        config.gateway_id = 42;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.volume, "testvol");
        assert_eq!(loaded.gateway_id, 42);
        assert_eq!(loaded.num_replica_threads, config.num_replica_threads);
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str("volume = \"v\"\ngateway_id = 7\n").unwrap();
        assert_eq!(config.max_read_freshness_ms, 5000);
        assert_eq!(config.max_write_freshness_ms, 0);
        assert_eq!(config.staging_dir(), config.data_root.join("staging"));
    }
}
