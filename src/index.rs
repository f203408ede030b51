//! Component D: the transactional metadata index.
//!
//! The distilled spec leaves "the specific SQL dialect" as an external
//! concern (§1); this build picks `rusqlite` (see SPEC_FULL.md §E.6),
//! the synchronous match for a core contract that tolerates blocking
//! I/O (§5) and is already in this retrieval pack's own lineage
//! (`facebook-sapling`'s `edenfs-commands` crate).

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::error::CasError;
use crate::lock::StoreLock;

/// Schema as shipped today. Kept distinct from `SCHEMA_VERSION_V1` so
/// the migration path (§4.D) from an older store has something real
/// to do and is exercised by tests.
const EXPECTED_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AciInfo {
    pub blob_key: String,
    pub app_name: String,
    pub import_time: i64,
    pub latest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub url: String,
    pub blob_key: String,
}

#[derive(Debug, Clone, Copy)]
pub enum SortField {
    BlobKey,
    AppName,
    ImportTime,
}

pub struct MetadataIndex {
    conn: Mutex<Connection>,
}

fn row_to_aci_info(row: &rusqlite::Row) -> rusqlite::Result<AciInfo> {
    Ok(AciInfo {
        blob_key: row.get(0)?,
        app_name: row.get(1)?,
        import_time: row.get(2)?,
        latest: row.get::<_, i64>(3)? != 0,
    })
}

fn read_stored_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let table_exists: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if table_exists == 0 {
        return Ok(None);
    }
    let version: i64 = conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))?;
    Ok(Some(version))
}

fn init_fresh(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE schema_version (version INTEGER NOT NULL);
         CREATE TABLE aci_info (
             blob_key TEXT PRIMARY KEY,
             app_name TEXT NOT NULL,
             import_time INTEGER NOT NULL,
             latest INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX aci_info_app_name_idx ON aci_info(app_name, import_time);
         CREATE TABLE remote (
             url TEXT PRIMARY KEY,
             blob_key TEXT NOT NULL
         );",
    )?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![EXPECTED_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Only ever invoked by tests, to stand up a store pinned at the
/// pre-`latest`-column schema so the migration path has something
/// real to migrate.
#[cfg(test)]
fn init_v1_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE schema_version (version INTEGER NOT NULL);
         CREATE TABLE aci_info (
             blob_key TEXT PRIMARY KEY,
             app_name TEXT NOT NULL,
             import_time INTEGER NOT NULL
         );
         CREATE TABLE remote (
             url TEXT PRIMARY KEY,
             blob_key TEXT NOT NULL
         );
         INSERT INTO schema_version (version) VALUES (1);",
    )
}

fn run_migrations(conn: &mut Connection, from_version: i64) -> Result<(), CasError> {
    let tx = conn.transaction()?;
    let mut version = from_version;
    if version < 2 {
        tx.execute_batch("ALTER TABLE aci_info ADD COLUMN latest INTEGER NOT NULL DEFAULT 0;")?;
        version = 2;
    }
    tx.execute("UPDATE schema_version SET version = ?1", params![version])?;
    tx.commit()?;
    Ok(())
}

fn backup_index_dir(db_dir: &Path, backups_dir: &Path, max_backups: usize) -> Result<(), CasError> {
    std::fs::create_dir_all(backups_dir)?;
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dest = backups_dir.join(stamp.to_string());
    std::fs::create_dir_all(&dest)?;
    for entry in std::fs::read_dir(db_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
        }
    }
    rotate_backups(backups_dir, max_backups)
}

fn rotate_backups(backups_dir: &Path, max_backups: usize) -> Result<(), CasError> {
    let mut entries: Vec<_> = std::fs::read_dir(backups_dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    while entries.len() > max_backups {
        let oldest = entries.remove(0);
        let path = oldest.path();
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

impl MetadataIndex {
    /// Open (or initialize) the index under `paths.db_dir()`, running
    /// the schema-migration protocol of §4.D: a shared-lock inspection
    /// first, and only if migration is actually needed, an
    /// exclusive-lock section that re-checks the version (another
    /// process may have migrated in the interim) before running
    /// migration steps in one transaction.
    pub fn open(db_dir: &Path, backups_dir: &Path, store_lock: &StoreLock, max_backups: usize) -> Result<Self, CasError> {
        std::fs::create_dir_all(db_dir)?;
        let db_file = db_dir.join("index.sqlite3");

        let needs_migrate = {
            let _guard = store_lock.shared()?;
            let conn = Connection::open(&db_file)?;
            match read_stored_version(&conn)? {
                None => {
                    init_fresh(&conn)?;
                    false
                }
                Some(v) if v == EXPECTED_SCHEMA_VERSION => false,
                Some(v) if v > EXPECTED_SCHEMA_VERSION => {
                    return Err(CasError::FutureSchemaError {
                        stored: v,
                        expected: EXPECTED_SCHEMA_VERSION,
                    });
                }
                Some(_) => true,
            }
        };

        if needs_migrate {
            let _guard = store_lock.exclusive()?;
            let mut conn = Connection::open(&db_file)?;
            match read_stored_version(&conn)? {
                Some(v) if v == EXPECTED_SCHEMA_VERSION => {
                    // Another process already migrated while we waited
                    // for the exclusive lock; nothing left to do.
                }
                Some(v) if v > EXPECTED_SCHEMA_VERSION => {
                    return Err(CasError::FutureSchemaError {
                        stored: v,
                        expected: EXPECTED_SCHEMA_VERSION,
                    });
                }
                Some(v) => {
                    backup_index_dir(db_dir, backups_dir, max_backups)?;
                    run_migrations(&mut conn, v)?;
                }
                None => init_fresh(&conn)?,
            }
        }

        let conn = Connection::open(&db_file)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn aci_info_by_blob_key(&self, key: &str) -> Result<Option<AciInfo>, CasError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT blob_key, app_name, import_time, latest FROM aci_info WHERE blob_key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_aci_info(row)?)),
            None => Ok(None),
        }
    }

    pub fn aci_info_by_app_name(&self, name: &str) -> Result<Vec<AciInfo>, CasError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT blob_key, app_name, import_time, latest FROM aci_info \
             WHERE app_name = ?1 ORDER BY import_time ASC",
        )?;
        let rows = stmt.query_map(params![name], row_to_aci_info)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn aci_info_by_key_prefix(&self, prefix: &str) -> Result<Vec<AciInfo>, CasError> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare(
            "SELECT blob_key, app_name, import_time, latest FROM aci_info \
             WHERE blob_key LIKE ?1 ESCAPE '\\' ORDER BY blob_key ASC",
        )?;
        let rows = stmt.query_map(params![pattern], row_to_aci_info)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn write_aci_info(&self, row: &AciInfo) -> Result<(), CasError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO aci_info (blob_key, app_name, import_time, latest) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(blob_key) DO UPDATE SET \
                app_name = excluded.app_name, import_time = excluded.import_time, latest = excluded.latest",
            params![row.blob_key, row.app_name, row.import_time, row.latest as i64],
        )?;
        Ok(())
    }

    /// Requires the row exists (else `NotFound`), then removes the ACI
    /// info row and any remote row referencing the same blob key, in
    /// one transaction (§3 invariant 2, §4.C `RemoveACI`).
    pub fn remove_aci_info(&self, key: &str) -> Result<(), CasError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let existed: i64 = tx.query_row("SELECT count(*) FROM aci_info WHERE blob_key = ?1", params![key], |r| {
            r.get(0)
        })?;
        if existed == 0 {
            return Err(CasError::NotFound(key.to_string()));
        }
        tx.execute("DELETE FROM aci_info WHERE blob_key = ?1", params![key])?;
        tx.execute("DELETE FROM remote WHERE blob_key = ?1", params![key])?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_remote(&self, url: &str) -> Result<(), CasError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM remote WHERE url = ?1", params![url])?;
        Ok(())
    }

    pub fn get_remote(&self, url: &str) -> Result<Option<RemoteInfo>, CasError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT url, blob_key FROM remote WHERE url = ?1")?;
        let mut rows = stmt.query(params![url])?;
        match rows.next()? {
            Some(row) => Ok(Some(RemoteInfo {
                url: row.get(0)?,
                blob_key: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    pub fn write_remote(&self, row: &RemoteInfo) -> Result<(), CasError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO remote (url, blob_key) VALUES (?1, ?2) \
             ON CONFLICT(url) DO UPDATE SET blob_key = excluded.blob_key",
            params![row.url, row.blob_key],
        )?;
        Ok(())
    }

    pub fn all_aci_infos(&self, sort_field: SortField, ascending: bool) -> Result<Vec<AciInfo>, CasError> {
        let column = match sort_field {
            SortField::BlobKey => "blob_key",
            SortField::AppName => "app_name",
            SortField::ImportTime => "import_time",
        };
        let direction = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT blob_key, app_name, import_time, latest FROM aci_info ORDER BY {} {}",
            column, direction
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_aci_info)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Diagnostic snapshot of the whole index (component E.8).
    pub fn dump(&self) -> Result<serde_json::Value, CasError> {
        let aci_infos = self.all_aci_infos(SortField::BlobKey, true)?;
        let remotes = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT url, blob_key FROM remote ORDER BY url ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok(RemoteInfo {
                    url: row.get(0)?,
                    blob_key: row.get(1)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(serde_json::json!({
            "aciInfoList": aci_infos.iter().map(|r| serde_json::json!({
                "blobKey": r.blob_key,
                "name": r.app_name,
                "importTime": r.import_time,
                "latest": r.latest,
            })).collect::<Vec<_>>(),
            "remoteList": remotes.iter().map(|r| serde_json::json!({
                "aciURL": r.url,
                "blobKey": r.blob_key,
            })).collect::<Vec<_>>(),
        }))
    }
}
