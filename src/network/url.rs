//! URL and staging-path namespace
//!
//! These formats are wire-visible: peers and RGs address content by them,
//! so they must not drift.
//!
//! - public file:      `<host>/<volume>/<fs_path>.<file_version>`
//! - public block:     `<host>/<volume>/<fs_path>.<file_version>/<block_id>.<block_version>`
//! - public manifest:  `<host>/<volume>/<fs_path>.<file_version>/manifest.<sec>.<nsec>`
//! - local staging:    `<data_root>/staging/<fs_path>.<file_version>/...`

use std::path::{Path, PathBuf};

/// Public URL of a file version
pub fn public_file_url(host: &str, volume: &str, fs_path: &str, file_version: i64) -> String {
    format!(
        "{}/{}{}.{}",
        host.trim_end_matches('/'),
        volume,
        fs_path,
        file_version
    )
}

/// Public URL of one block version
pub fn public_block_url(
    host: &str,
    volume: &str,
    fs_path: &str,
    file_version: i64,
    block_id: u64,
    block_version: i64,
) -> String {
    format!(
        "{}/{}.{}",
        public_file_url(host, volume, fs_path, file_version),
        block_id,
        block_version
    )
}

/// Public URL of a manifest, addressed by its modtime
pub fn public_manifest_url(
    host: &str,
    volume: &str,
    fs_path: &str,
    file_version: i64,
    mtime_sec: i64,
    mtime_nsec: i32,
) -> String {
    format!(
        "{}/manifest.{}.{}",
        public_file_url(host, volume, fs_path, file_version),
        mtime_sec,
        mtime_nsec
    )
}

/// Local staging directory of a file version
pub fn staging_file_path(data_root: &Path, fs_path: &str, file_version: i64) -> PathBuf {
    let rel = format!("{}.{}", fs_path.trim_start_matches('/'), file_version);
    data_root.join("staging").join(rel)
}

/// Local staging path of one block version
pub fn staging_block_path(
    data_root: &Path,
    fs_path: &str,
    file_version: i64,
    block_id: u64,
    block_version: i64,
) -> PathBuf {
    staging_file_path(data_root, fs_path, file_version)
        .join(format!("{}.{}", block_id, block_version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_urls() {
        assert_eq!(
            public_file_url("http://gw:9600", "vol", "/a/b", 3),
            "http://gw:9600/vol/a/b.3"
        );
        assert_eq!(
            public_block_url("http://gw:9600", "vol", "/a/b", 3, 7, 2),
            "http://gw:9600/vol/a/b.3/7.2"
        );
        assert_eq!(
            public_manifest_url("http://gw:9600/", "vol", "/a/b", 3, 55, 120),
            "http://gw:9600/vol/a/b.3/manifest.55.120"
        );
    }

    #[test]
    fn test_staging_paths() {
        let root = Path::new("/var/lib/syndicate-ug");
        assert_eq!(
            staging_block_path(root, "/a/b", 3, 7, 2),
            PathBuf::from("/var/lib/syndicate-ug/staging/a/b.3/7.2")
        );
    }
}
