use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use rusqlite::{Connection, OptionalExtension};
use whip_proto::AssetId;

use crate::{Asset, StorageError};

/// Schema version stamped into new index files.
const SCHEMA_VERSION: i64 = 1;

/// How many index databases may be open at once across all shards.
const MAX_OPEN_FILES: usize = 512;

/// One shard-local SQLite index database mapping asset ids to record
/// positions in the sibling data file.
pub struct IndexFile {
    conn: Connection,
}

impl IndexFile {
    /// Opens (and on first use initializes) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND tbl_name = 'VFSVersions'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            conn.execute_batch(&format!(
                "BEGIN;
                 CREATE TABLE VFSVersions (version INTEGER PRIMARY KEY);
                 CREATE TABLE VFSDataIndex (
                     asset_id CHARACTER(32) PRIMARY KEY,
                     position BIGINT NOT NULL,
                     type INTEGER NOT NULL,
                     created_on DATETIME DEFAULT CURRENT_TIMESTAMP,
                     deleted TINYINT NOT NULL
                 );
                 INSERT INTO VFSVersions(version) VALUES({SCHEMA_VERSION});
                 COMMIT;"
            ))?;
        }

        Ok(IndexFile { conn })
    }

    /// The data-file position recorded for `id`, honoring tombstones.
    pub fn find_position(&self, id: &AssetId) -> Result<Option<u64>, StorageError> {
        let position: Option<i64> = self
            .conn
            .query_row(
                "SELECT position FROM VFSDataIndex WHERE asset_id = ?1 AND deleted = 0",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.map(|p| p as u64))
    }

    /// Records a freshly appended asset at `position`.
    pub fn record(&self, asset: &Asset, position: u64) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO VFSDataIndex(asset_id, position, type, deleted) VALUES(?1, ?2, ?3, 0)",
            rusqlite::params![asset.id().as_str(), position as i64, asset.kind() as i64],
        )?;
        Ok(())
    }

    /// Every asset id recorded in this index.
    pub fn contained_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT asset_id FROM VFSDataIndex")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

/// LRU pool of open index databases, owned by the disk worker. Opening a
/// database is comparatively expensive and shards are revisited in bursts,
/// so handles stay open until the pool overflows or a force-close evicts
/// them ahead of physical deletion.
pub struct IndexFilePool {
    files: LruCache<PathBuf, IndexFile>,
}

impl IndexFilePool {
    pub fn new() -> Self {
        IndexFilePool {
            files: LruCache::new(NonZeroUsize::new(MAX_OPEN_FILES).expect("pool size is nonzero")),
        }
    }

    /// Fetches the pooled handle for `path`, opening it on a miss.
    pub fn open(&mut self, path: &Path) -> Result<&IndexFile, StorageError> {
        if !self.files.contains(path) {
            let file = IndexFile::open(path)?;
            self.files.push(path.to_path_buf(), file);
        }
        Ok(self.files.get(path).expect("handle was just inserted"))
    }

    /// Closes the pooled handle for `path`, if any. Used before deleting the
    /// file from disk.
    pub fn force_close(&mut self, path: &Path) {
        self.files.pop(path);
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

impl Default for IndexFilePool {
    fn default() -> Self {
        Self::new()
    }
}
