use std::path::PathBuf;

use crate::{Asset, DataFile, IndexFilePool, StorageError, GLOBALS_BASE, LOCALS_BASE};
use whip_proto::AssetId;

/// One index/data pair (`<base>.idx` / `<base>.data`) within a shard.
struct VfsDatabase {
    index_path: PathBuf,
    data: DataFile,
}

impl VfsDatabase {
    fn new(dir: &PathBuf, base: &str) -> Self {
        VfsDatabase {
            index_path: dir.join(format!("{base}.idx")),
            data: DataFile::new(dir.join(format!("{base}.data"))),
        }
    }

    fn get(&self, pool: &mut IndexFilePool, id: &AssetId) -> Result<Option<Asset>, StorageError> {
        if !self.index_path.exists() {
            return Ok(None);
        }
        let position = match pool.open(&self.index_path)?.find_position(id)? {
            Some(position) => position,
            None => return Ok(None),
        };
        let data = self.data.read_at(position)?;
        Ok(Some(Asset::from_bytes(data)?))
    }

    fn exists(&self, pool: &mut IndexFilePool, id: &AssetId) -> Result<bool, StorageError> {
        if !self.index_path.exists() {
            return Ok(false);
        }
        Ok(pool.open(&self.index_path)?.find_position(id)?.is_some())
    }

    fn store(&self, pool: &mut IndexFilePool, asset: &Asset) -> Result<u64, StorageError> {
        let position = self.data.append(asset)?;
        pool.open(&self.index_path)?.record(asset, position)?;
        Ok(position)
    }
}

/// The pair of databases in one shard directory: globals replicate across
/// the fleet, locals are node-private.
pub struct DatabaseSet {
    globals: VfsDatabase,
    locals: VfsDatabase,
}

impl DatabaseSet {
    pub fn new(dir: PathBuf) -> Self {
        DatabaseSet {
            globals: VfsDatabase::new(&dir, GLOBALS_BASE),
            locals: VfsDatabase::new(&dir, LOCALS_BASE),
        }
    }

    /// Looks `id` up in the globals database first, then locals.
    pub fn get(
        &self,
        pool: &mut IndexFilePool,
        id: &AssetId,
    ) -> Result<Option<Asset>, StorageError> {
        if let Some(asset) = self.globals.get(pool, id)? {
            return Ok(Some(asset));
        }
        self.locals.get(pool, id)
    }

    pub fn exists(&self, pool: &mut IndexFilePool, id: &AssetId) -> Result<bool, StorageError> {
        Ok(self.globals.exists(pool, id)? || self.locals.exists(pool, id)?)
    }

    /// Appends `asset` to the database selected by its locality flag and
    /// records its position. Callers are expected to have screened
    /// duplicates through the existence index first; a duplicate that races
    /// past it fails on the index's primary key.
    pub fn store(&self, pool: &mut IndexFilePool, asset: &Asset) -> Result<u64, StorageError> {
        if asset.is_local() {
            self.locals.store(pool, asset)
        } else {
            self.globals.store(pool, asset)
        }
    }
}
