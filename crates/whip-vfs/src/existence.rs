use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use uuid::Uuid;
use whip_proto::AssetId;

use crate::StorageError;

/// In-memory set of every asset id stored on this node, in compact 128-bit
/// form. It front-runs the disk on both sides: negative lookups answer GETs
/// without queueing disk work, and a store reserves its id here *before* the
/// write is queued so that a read racing the write still serializes behind
/// it in the disk queue.
pub struct ExistenceIndex {
    ids: Mutex<HashSet<Uuid>>,
}

impl ExistenceIndex {
    /// Builds the index by scanning every `*.idx` database under every shard
    /// directory of `root`, keeping rows that are not tombstoned.
    pub fn load(root: &Path) -> Result<Self, StorageError> {
        let index = ExistenceIndex {
            ids: Mutex::new(HashSet::new()),
        };

        let mut scanned = 0usize;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if scanned % 100 == 0 {
                tracing::info!(shard = %entry.path().display(), "processing index");
            }
            scanned += 1;
            index.load_shard(&entry.path())?;
        }

        tracing::info!(
            shards = scanned,
            assets = index.len(),
            "existence index built"
        );
        Ok(index)
    }

    fn load_shard(&self, dir: &Path) -> Result<(), StorageError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "idx").unwrap_or(false) {
                self.load_index_file(&path)?;
            }
        }
        Ok(())
    }

    fn load_index_file(&self, path: &Path) -> Result<(), StorageError> {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let mut stmt = conn.prepare("SELECT asset_id, deleted FROM VFSDataIndex")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut ids = self.ids.lock().expect("existence index lock");
        for row in rows {
            let (id, deleted) = row?;
            if deleted != 0 {
                continue;
            }
            match id.parse::<AssetId>() {
                Ok(id) => {
                    ids.insert(id.to_uuid());
                }
                Err(_) => {
                    tracing::warn!(%id, index = %path.display(), "skipping malformed id in index")
                }
            }
        }
        Ok(())
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.ids
            .lock()
            .expect("existence index lock")
            .contains(&id.to_uuid())
    }

    /// Returns false if the id was already present.
    pub fn insert(&self, id: &AssetId) -> bool {
        self.ids
            .lock()
            .expect("existence index lock")
            .insert(id.to_uuid())
    }

    pub fn remove(&self, id: &AssetId) {
        self.ids
            .lock()
            .expect("existence index lock")
            .remove(&id.to_uuid());
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("existence index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
