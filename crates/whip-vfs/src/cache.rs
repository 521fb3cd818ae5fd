use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use whip_proto::AssetId;

use crate::Asset;

/// Fixed per-entry bookkeeping charge added to each asset's size: the
/// 32-byte id plus 8 bytes of accounting.
const ENTRY_OVERHEAD: u64 = 40;

/// A byte-budgeted LRU cache in front of the disk backend. Entries are
/// charged `asset.len() + 40` bytes against the budget; inserting past the
/// budget evicts least-recently-used entries until the sum fits again.
pub struct AssetCache {
    max_bytes: u64,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct Inner {
    entries: LruCache<AssetId, Asset>,
    bytes: u64,
}

fn entry_size(asset: &Asset) -> u64 {
    asset.len() as u64 + ENTRY_OVERHEAD
}

impl AssetCache {
    pub fn new(max_bytes: u64) -> Self {
        tracing::info!(max_mb = max_bytes / 1_000_000, "asset cache enabled");
        AssetCache {
            max_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache lookup, promoting the entry and counting a hit or miss.
    pub fn fetch(&self, id: &AssetId) -> Option<Asset> {
        let mut inner = self.inner.lock().expect("cache lock");
        match inner.entries.get(id) {
            Some(asset) => {
                let asset = asset.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(asset)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Existence probe that neither promotes nor touches the counters.
    pub fn contains(&self, id: &AssetId) -> bool {
        self.inner
            .lock()
            .expect("cache lock")
            .entries
            .peek(id)
            .is_some()
    }

    /// Inserts `asset`, evicting LRU entries as needed to stay inside the
    /// byte budget. Assets bigger than the whole budget are not cached.
    pub fn insert(&self, asset: Asset) {
        let size = entry_size(&asset);
        if size > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock().expect("cache lock");
        if let Some(previous) = inner.entries.push(asset.id(), asset) {
            // push returns the displaced entry for this same key, if any.
            inner.bytes -= entry_size(&previous.1);
        }
        inner.bytes += size;

        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.bytes -= entry_size(&evicted),
                None => break,
            }
        }
    }

    /// Opportunistic insert used by the intramesh path when a peer supplied
    /// an asset this node does not hold on disk.
    pub fn inform(&self, asset: &Asset) {
        self.insert(asset.clone());
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn status_report(&self, out: &mut String) {
        let (count, _bytes) = {
            let inner = self.inner.lock().expect("cache lock");
            (inner.entries.len(), inner.bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        writeln!(out, "-Asset Cache").unwrap();
        writeln!(out, "  Cache max size (MB): {}", self.max_bytes / 1_000_000).unwrap();
        writeln!(out, "  Cache item count: {count}").unwrap();
        writeln!(out, "  Cache hits/miss: {hits}/{misses}").unwrap();
        let total = hits + misses;
        if total > 0 {
            let miss_pct = (misses as f32 / total as f32 * 100.0) as u64;
            writeln!(out, "  Cache hit%: {}", 100 - miss_pct).unwrap();
        }
    }

    #[cfg(test)]
    fn bytes(&self) -> u64 {
        self.inner.lock().unwrap().bytes
    }
}
