use std::fmt::Write as _;
use std::sync::Arc;

use whip_proto::AssetId;
use whip_vfs::{Asset, AssetCache, StorageError, VfsHandle};

/// The cache-over-disk read/write path every session talks to. With caching
/// disabled this is a transparent shim over the disk backend.
#[derive(Clone)]
pub struct AssetStore {
    vfs: VfsHandle,
    cache: Option<Arc<AssetCache>>,
}

impl AssetStore {
    pub fn new(vfs: VfsHandle, cache: Option<Arc<AssetCache>>) -> Self {
        AssetStore { vfs, cache }
    }

    pub fn vfs(&self) -> &VfsHandle {
        &self.vfs
    }

    pub fn cache(&self) -> Option<&Arc<AssetCache>> {
        self.cache.as_ref()
    }

    /// Cache first, then the disk queue. `cache_result` is false for
    /// GET_DONTCACHE: the lookup may still be served from the cache but a
    /// disk hit will not be inserted on the way back.
    pub async fn get(&self, id: &AssetId, cache_result: bool) -> Result<Asset, StorageError> {
        if let Some(cache) = &self.cache {
            if let Some(asset) = cache.fetch(id) {
                return Ok(asset);
            }
        }

        let asset = self.vfs.get(id).await?;
        if cache_result {
            if let Some(cache) = &self.cache {
                cache.insert(asset.clone());
            }
        }
        Ok(asset)
    }

    /// Writes through to disk; the cache is populated only once the disk
    /// accepted the asset.
    pub async fn put(&self, asset: Asset) -> Result<(), StorageError> {
        self.vfs.put(asset.clone()).await?;
        if let Some(cache) = &self.cache {
            cache.insert(asset);
        }
        Ok(())
    }

    /// Synchronous existence probe: the cache, then the existence index.
    pub fn exists(&self, id: &AssetId) -> bool {
        if let Some(cache) = &self.cache {
            if cache.contains(id) {
                return true;
            }
        }
        self.vfs.exists(id)
    }

    pub async fn purge(&self, id: &AssetId) -> Result<(), StorageError> {
        self.vfs.purge(id).await
    }

    pub fn begin_purge_locals(&self) {
        self.vfs.begin_purge_locals();
    }

    pub async fn stored_ids(&self, prefix: &str) -> Result<String, StorageError> {
        self.vfs.stored_ids(prefix).await
    }

    /// The cache and disk sections of the status report.
    pub async fn status_report(&self, out: &mut String) -> Result<(), StorageError> {
        if let Some(cache) = &self.cache {
            cache.status_report(out);
        }
        let backend = self.vfs.status_report().await?;
        let _ = write!(out, "{backend}");
        Ok(())
    }
}
