//! Owns the on-disk directory layout under `<base>/cas/` (component C).
//!
//! Unlike `proxmox-backup`'s `buildcfg`, which bakes in a single
//! system-wide `/etc/proxmox-backup`, this store's base directory is
//! caller-supplied — a `StorePaths` is just a thin set of path
//! computations over it, not a compiled-in constant.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::CasError;
use crate::key;

#[derive(Debug, Clone)]
pub struct StorePaths {
    base: PathBuf,
}

impl StorePaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn cas_dir(&self) -> PathBuf {
        self.base.join("cas")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.cas_dir().join("blob")
    }

    pub fn image_manifest_dir(&self) -> PathBuf {
        self.cas_dir().join("imageManifest")
    }

    pub fn tree_dir(&self) -> PathBuf {
        self.cas_dir().join("tree")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.cas_dir().join("tmp")
    }

    pub fn image_locks_dir(&self) -> PathBuf {
        self.cas_dir().join("imagelocks")
    }

    pub fn tree_store_locks_dir(&self) -> PathBuf {
        self.cas_dir().join("treestorelocks")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.cas_dir().join("db")
    }

    pub fn db_backups_dir(&self) -> PathBuf {
        self.cas_dir().join("db-backups")
    }

    pub fn store_lock_file(&self) -> PathBuf {
        self.cas_dir().join("store.lock")
    }

    /// Full path to a blob's bytes, sharded two levels deep.
    pub fn blob_path(&self, key: &str) -> Result<PathBuf, CasError> {
        let (a, b) = key::shard_components(key)?;
        Ok(self.blob_dir().join(a).join(b).join(key))
    }

    /// Full path to an image manifest, sharded the same way as its blob.
    pub fn manifest_path(&self, key: &str) -> Result<PathBuf, CasError> {
        let (a, b) = key::shard_components(key)?;
        Ok(self.image_manifest_dir().join(a).join(b).join(key))
    }

    /// Root of a tree rendering for `key`.
    pub fn tree_path(&self, key: &str) -> PathBuf {
        self.tree_dir().join(key)
    }

    /// Create every directory in the layout that must exist before the
    /// store can be used. Shard subdirectories under `blob/` and
    /// `imageManifest/` are created lazily, on first write into them.
    pub fn ensure_layout(&self) -> io::Result<()> {
        for dir in [
            self.cas_dir(),
            self.blob_dir(),
            self.image_manifest_dir(),
            self.tree_dir(),
            self.tmp_dir(),
            self.image_locks_dir(),
            self.tree_store_locks_dir(),
            self.db_dir(),
            self.db_backups_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_and_manifest_paths_share_shard() {
        let paths = StorePaths::new("/srv/store");
        let key = format!("sha512-{}", "ab".repeat(32));
        let blob = paths.blob_path(&key).unwrap();
        let manifest = paths.manifest_path(&key).unwrap();
        assert_eq!(blob, paths.blob_dir().join("ab").join("ab").join(&key));
        assert_eq!(manifest, paths.image_manifest_dir().join("ab").join("ab").join(&key));
        assert_eq!(blob.file_name().unwrap(), manifest.file_name().unwrap());
    }
}
