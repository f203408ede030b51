//! Component C: the content-addressable blob store.
//!
//! `BlobStore` is the facade every other component sits behind: it
//! owns the on-disk layout, the store-wide and per-image locks, and
//! the metadata index, and it is the only thing that ever touches
//! `blob/` and `imageManifest/` directly. Every public method here
//! opens with the store-wide shared lock for the duration of the call
//! (per the lock-discipline table in §4.B — every operation except
//! schema migration holds the store lock shared), then layers the
//! per-key lock the operation actually needs.

use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha512};

use crate::archive;
use crate::config::StorePaths;
use crate::error::CasError;
use crate::index::{AciInfo, MetadataIndex, RemoteInfo, SortField};
use crate::key::{self, KeyValidity};
use crate::lock::{LockManager, StoreLock};
use crate::manifest::{ImageManifest, Label};
use crate::registry::SecondaryBlobSource;

/// How many rotated copies of `db/` to retain under `db-backups/`
/// across schema migrations (§4.D).
const DEFAULT_MAX_DB_BACKUPS: usize = 5;

pub struct BlobStore {
    paths: StorePaths,
    store_lock: StoreLock,
    image_locks: LockManager,
    tree_locks: LockManager,
    index: MetadataIndex,
    secondary_source: Option<Arc<dyn SecondaryBlobSource>>,
}

impl BlobStore {
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, CasError> {
        let paths = StorePaths::new(base);
        paths.ensure_layout()?;

        let store_lock = StoreLock::new(paths.store_lock_file());
        let image_locks = LockManager::new(paths.image_locks_dir())?;
        let tree_locks = LockManager::new(paths.tree_store_locks_dir())?;
        let index = MetadataIndex::open(
            &paths.db_dir(),
            &paths.db_backups_dir(),
            &store_lock,
            DEFAULT_MAX_DB_BACKUPS,
        )?;

        log::info!("opened aci-cas store at {:?}", paths.base());

        Ok(Self {
            paths,
            store_lock,
            image_locks,
            tree_locks,
            index,
            secondary_source: None,
        })
    }

    pub fn with_secondary_source(mut self, source: Arc<dyn SecondaryBlobSource>) -> Self {
        self.secondary_source = Some(source);
        self
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub(crate) fn tree_locks(&self) -> &LockManager {
        &self.tree_locks
    }

    pub(crate) fn store_lock(&self) -> &StoreLock {
        &self.store_lock
    }

    /// A fresh temp file on the same filesystem as the store, so that
    /// import can complete with a rename instead of a cross-device
    /// copy (§4.C step 6).
    pub fn tmp_file(&self) -> Result<tempfile::NamedTempFile, CasError> {
        Ok(tempfile::NamedTempFile::new_in(self.paths.tmp_dir())?)
    }

    pub fn tmp_dir(&self) -> Result<tempfile::TempDir, CasError> {
        Ok(tempfile::tempdir_in(self.paths.tmp_dir())?)
    }

    /// Component A, exposed at the store boundary (§6's `HashToKey`).
    pub fn hash_to_key(digest: &[u8]) -> Result<String, CasError> {
        key::digest_to_key(digest)
    }

    /// Component E: resolve a (possibly partial, possibly over-long)
    /// key to the unique full key it denotes.
    pub fn resolve_key(&self, k: &str) -> Result<String, CasError> {
        if k.len() > key::FULL_KEY_LEN {
            return Ok(key::truncate_to_full_length(k));
        }
        if k.len() == key::FULL_KEY_LEN {
            return Ok(k.to_string());
        }
        match key::validate_key(k) {
            KeyValidity::Invalid => Err(CasError::InvalidKey(k.to_string())),
            _ => {
                let matches = self.index.aci_info_by_key_prefix(k)?;
                match matches.len() {
                    0 => Err(CasError::NotFound(k.to_string())),
                    1 => Ok(matches[0].blob_key.clone()),
                    n => Err(CasError::AmbiguousKey(k.to_string(), n)),
                }
            }
        }
    }

    /// The write pipeline (§4.C `WriteACI`): decompress, tee to a
    /// fresh temp file and a running SHA-512, extract the manifest,
    /// derive the key, import under an exclusive image lock, and
    /// commit one index row.
    pub fn write_aci<R>(&self, input: R, latest: bool) -> Result<String, CasError>
    where
        R: Read + Seek + 'static,
    {
        let _store_guard = self.store_lock.shared()?;

        let mut decompressed = archive::new_compressed_reader(input)?;

        let mut tmp = self.tmp_file()?;
        let mut hasher = Sha512::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = decompressed.read(&mut buf).map_err(CasError::DecompressionError)?;
            if n == 0 {
                break;
            }
            tmp.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
        }
        tmp.flush()?;

        let mut manifest_source = tmp.reopen()?;
        let manifest = archive::manifest_from_archive(&mut manifest_source)?;

        let digest = hasher.finalize();
        let key = key::digest_to_key(&digest)?;

        let _image_guard = self.image_locks.exclusive_lock(&key)?;

        let blob_path = self.paths.blob_path(&key)?;
        if let Some(parent) = blob_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tmp.persist(&blob_path).map_err(|e| CasError::ImportError(e.error))?;

        let manifest_path = self.paths.manifest_path(&key)?;
        if let Some(parent) = manifest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut manifest_tmp = self.tmp_file()?;
        serde_json::to_writer(&mut manifest_tmp, &manifest).map_err(|e| CasError::ManifestError(anyhow::Error::new(e)))?;
        manifest_tmp.flush()?;
        manifest_tmp
            .persist(&manifest_path)
            .map_err(|e| CasError::ImportError(e.error))?;

        let import_time = now_unix();
        self.index.write_aci_info(&AciInfo {
            blob_key: key.clone(),
            app_name: manifest.name.clone(),
            import_time,
            latest,
        })?;

        log::info!("wrote ACI {} (name={}, latest={})", key, manifest.name, latest);

        Ok(key)
    }

    /// §4.C `ReadStream`.
    pub fn read_stream(&self, k: &str) -> Result<Box<dyn Read>, CasError> {
        let _store_guard = self.store_lock.shared()?;
        let full_key = self.resolve_key(k)?;
        let _image_guard = self.image_locks.shared_lock(&full_key)?;

        let blob_path = self.paths.blob_path(&full_key)?;
        match std::fs::File::open(&blob_path) {
            Ok(file) => {
                log::debug!("read blob {}", full_key);
                Ok(Box::new(file))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(source) = &self.secondary_source {
                    if let Some(stream) = source.fetch_by_digest(&full_key)? {
                        return Ok(stream);
                    }
                }
                Err(CasError::NotFound(full_key))
            }
            Err(err) => Err(CasError::ImportError(err)),
        }
    }

    /// §4.C: the manifest shares the image's key and lock.
    pub fn get_image_manifest(&self, k: &str) -> Result<ImageManifest, CasError> {
        let _store_guard = self.store_lock.shared()?;
        let full_key = self.resolve_key(k)?;
        let _image_guard = self.image_locks.shared_lock(&full_key)?;

        let manifest_path = self.paths.manifest_path(&full_key)?;
        let data = std::fs::read(&manifest_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound(full_key.clone())
            } else {
                CasError::ImportError(err)
            }
        })?;
        serde_json::from_slice(&data).map_err(|e| CasError::ManifestError(anyhow::Error::new(e)))
    }

    /// §4.C `RemoveACI`: the index transaction is authoritative;
    /// leftover bytes on a partial erase are reported, not rolled
    /// back.
    pub fn remove_aci(&self, k: &str) -> Result<(), CasError> {
        let _store_guard = self.store_lock.shared()?;
        let full_key = self.resolve_key(k)?;
        let _image_guard = self.image_locks.exclusive_lock(&full_key)?;

        self.index.remove_aci_info(&full_key)?;

        let mut errors = Vec::new();
        for path in [self.paths.blob_path(&full_key)?, self.paths.manifest_path(&full_key)?] {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    errors.push((path, err));
                }
            }
        }

        log::info!("removed ACI {}", full_key);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CasError::RemovalError(errors))
        }
    }

    /// Resolve an application name plus an optional label query to a
    /// single blob key. With a non-empty `labels` query, the most
    /// recently imported row whose manifest satisfies every requested
    /// label wins (scenario 3). With an empty query, the row marked
    /// `latest` wins; if none is marked, the most recently imported
    /// row is returned (scenario 4).
    pub fn get_aci(&self, name: &str, labels: &[Label]) -> Result<String, CasError> {
        let _store_guard = self.store_lock.shared()?;
        let rows = self.index.aci_info_by_app_name(name)?;
        if rows.is_empty() {
            return Err(CasError::NotFound(name.to_string()));
        }

        if labels.is_empty() {
            if let Some(row) = rows.iter().rev().find(|r| r.latest) {
                return Ok(row.blob_key.clone());
            }
            return Ok(rows.last().unwrap().blob_key.clone());
        }

        for row in rows.iter().rev() {
            let manifest = self.get_image_manifest(&row.blob_key)?;
            if manifest.matches_labels(labels) {
                return Ok(row.blob_key.clone());
            }
        }
        Err(CasError::NotFound(format!("{} matching requested labels", name)))
    }

    pub fn get_all_aci_infos(&self, sort_field: SortField, ascending: bool) -> Result<Vec<AciInfo>, CasError> {
        let _store_guard = self.store_lock.shared()?;
        self.index.all_aci_infos(sort_field, ascending)
    }

    pub fn get_remote(&self, url: &str) -> Result<Option<RemoteInfo>, CasError> {
        let _store_guard = self.store_lock.shared()?;
        self.index.get_remote(url)
    }

    pub fn write_remote(&self, row: &RemoteInfo) -> Result<(), CasError> {
        let _store_guard = self.store_lock.shared()?;
        self.index.write_remote(row)
    }

    /// Diagnostic snapshot (§6 `Dump`).
    pub fn dump(&self) -> Result<serde_json::Value, CasError> {
        let _store_guard = self.store_lock.shared()?;
        self.index.dump()
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_aci(name: &str, labels: &[(&str, &str)], content: &[u8]) -> Vec<u8> {
        let manifest = serde_json::json!({
            "name": name,
            "labels": labels.iter().map(|(n, v)| serde_json::json!({"name": n, "value": v})).collect::<Vec<_>>(),
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "manifest", &manifest_bytes[..]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "rootfs/file.txt", content).unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn round_trip_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let archive = build_aci("example.com/app", &[], b"hello world");

        let key = store.write_aci(Cursor::new(archive), false).unwrap();
        assert_eq!(key.len(), key::FULL_KEY_LEN);
        assert!(key.starts_with(key::KEY_PREFIX));

        let mut out = Vec::new();
        store.read_stream(&key).unwrap().read_to_end(&mut out).unwrap();

        // the stored blob is the *uncompressed archive*, not the file payload alone
        assert_eq!(out, archive);
    }

    #[test]
    fn partial_key_resolves_when_unique_errors_when_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let key_a = store.write_aci(Cursor::new(build_aci("a", &[], b"AAAA")), false).unwrap();
        let key_b = store.write_aci(Cursor::new(build_aci("b", &[], b"BBBB")), false).unwrap();

        let shared_prefix: String = key_a
            .chars()
            .zip(key_b.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect();

        if shared_prefix.len() >= key::MIN_PARTIAL_KEY_LEN {
            let err = store.resolve_key(&shared_prefix).unwrap_err();
            assert!(matches!(err, CasError::AmbiguousKey(_, 2)));
        }

        assert_eq!(store.resolve_key(&key_a).unwrap(), key_a);
    }

    #[test]
    fn remove_then_read_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let key = store.write_aci(Cursor::new(build_aci("a", &[], b"AAAA")), false).unwrap();

        store.remove_aci(&key).unwrap();

        assert!(store.index.aci_info_by_blob_key(&key).unwrap().is_none());
        assert!(matches!(store.read_stream(&key).unwrap_err(), CasError::NotFound(_)));
    }

    #[test]
    fn get_aci_prefers_latest_import_among_label_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        store
            .write_aci(Cursor::new(build_aci("example.com/app", &[("version", "1.0"), ("os", "linux")], b"v1")), false)
            .unwrap();
        store
            .write_aci(
                Cursor::new(build_aci("example.com/app", &[("version", "1.1"), ("os", "linux")], b"v1.1-linux")),
                false,
            )
            .unwrap();
        let darwin_key = store
            .write_aci(
                Cursor::new(build_aci("example.com/app", &[("version", "1.1"), ("os", "darwin")], b"v1.1-darwin")),
                false,
            )
            .unwrap();

        let resolved = store
            .get_aci("example.com/app", &[Label::new("version", "1.1")])
            .unwrap();
        assert_eq!(resolved, darwin_key);
    }

    #[test]
    fn get_aci_prefers_latest_flag_over_import_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let first_key = store
            .write_aci(Cursor::new(build_aci("example.com/app", &[("version", "1.0")], b"v1")), true)
            .unwrap();
        store
            .write_aci(Cursor::new(build_aci("example.com/app", &[("version", "1.1")], b"v1.1")), false)
            .unwrap();

        let resolved = store.get_aci("example.com/app", &[]).unwrap();
        assert_eq!(resolved, first_key);
    }
}
