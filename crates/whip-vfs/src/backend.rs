use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use whip_proto::AssetId;

use crate::{Asset, DatabaseSet, ExistenceIndex, IndexFilePool, StorageError, GLOBALS_BASE, LOCALS_BASE};

/// Window of the queue-wait and op-duration moving averages.
const LATENCY_SAMPLE_SIZE: usize = 50;

/// Spacing between shard purges while a purge-locals run is active.
const PURGE_TICK: Duration = Duration::from_secs(1);

/// Number of shard directories / 3-hex-character prefixes.
const SHARD_COUNT: u32 = 0x1000;

/// Invoked by the disk worker for every successfully stored asset; push
/// replication hangs off of this.
pub type StoreHook = Box<dyn Fn(Asset) + Send + Sync>;

enum VfsRequest {
    Get {
        id: AssetId,
        reply: oneshot::Sender<Result<Asset, StorageError>>,
    },
    Put {
        asset: Asset,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    // Purge is deliberately a no-op: it passes through the queue so it
    // serializes with surrounding operations, then reports success.
    Purge {
        id: AssetId,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    CollectLocalIds {
        prefix: String,
        reply: oneshot::Sender<Result<Vec<AssetId>, StorageError>>,
    },
    DeleteLocalStorage {
        prefix: String,
    },
    CollectStatus {
        reply: oneshot::Sender<String>,
    },
    StoredIds {
        prefix: String,
        reply: oneshot::Sender<Result<String, StorageError>>,
    },
    Shutdown,
}

impl VfsRequest {
    fn describe(&self) -> String {
        match self {
            VfsRequest::Get { id, .. } => format!("GET {id}"),
            VfsRequest::Put { asset, .. } => format!("PUT {}", asset.id()),
            VfsRequest::Purge { id, .. } => format!("PURGE {id}"),
            VfsRequest::CollectLocalIds { prefix, .. } => format!("PURGE LOCALS {prefix}"),
            VfsRequest::DeleteLocalStorage { prefix } => {
                format!("DELETE LOCAL STORAGE {prefix}")
            }
            VfsRequest::CollectStatus { .. } => "COLLECT STATUS".to_string(),
            VfsRequest::StoredIds { .. } => "GET STORED IDS".to_string(),
            VfsRequest::Shutdown => "SHUTDOWN".to_string(),
        }
    }
}

struct QueuedRequest {
    request: VfsRequest,
    queued: Instant,
}

/// Mirror of the waiting queue's descriptions, readable by status requests.
struct QueueMirror {
    items: Mutex<VecDeque<String>>,
}

struct MovingAverage {
    samples: VecDeque<u64>,
    window: usize,
}

impl MovingAverage {
    fn new(window: usize) -> Self {
        MovingAverage {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    fn add_sample(&mut self, sample: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn average(&self) -> u64 {
        if self.samples.is_empty() {
            0
        } else {
            self.samples.iter().sum::<u64>() / self.samples.len() as u64
        }
    }
}

/// The storage backend: owns the disk worker thread. Cheap [`VfsHandle`]
/// clones are what the rest of the server holds.
pub struct VfsBackend {
    handle: VfsHandle,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl VfsBackend {
    /// Builds the existence index from `root` and starts the disk worker.
    /// The storage root must already exist.
    pub fn start(
        root: impl Into<PathBuf>,
        store_hook: Option<StoreHook>,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        tracing::info!(root = %root.display(), "starting storage backend");
        if !root.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("storage root '{}' was not found", root.display()),
            )));
        }

        tracing::info!(sqlite = rusqlite::version(), "sqlite index backend");
        tracing::info!("generating asset existence index");
        let index = Arc::new(ExistenceIndex::load(&root)?);

        let (tx, rx) = mpsc::unbounded_channel();
        let mirror = Arc::new(QueueMirror {
            items: Mutex::new(VecDeque::new()),
        });

        tracing::info!("starting disk i/o worker thread");
        let worker = {
            let index = index.clone();
            let mirror = mirror.clone();
            std::thread::Builder::new()
                .name("vfs-worker".to_string())
                .spawn(move || work_loop(root, rx, index, mirror, store_hook))
                .map_err(StorageError::Io)?
        };

        Ok(VfsBackend {
            handle: VfsHandle {
                tx,
                index,
                mirror,
                purging: Arc::new(AtomicBool::new(false)),
            },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> VfsHandle {
        self.handle.clone()
    }

    /// Queues a shutdown marker, then waits for the worker to drain every
    /// request ahead of it and exit.
    pub async fn shutdown(mut self) {
        tracing::info!("storage backend performing clean shutdown");
        let _ = self.handle.submit(VfsRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
        tracing::info!("storage backend shutdown complete");
    }
}

#[derive(Clone)]
pub struct VfsHandle {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    index: Arc<ExistenceIndex>,
    mirror: Arc<QueueMirror>,
    purging: Arc<AtomicBool>,
}

impl VfsHandle {
    fn submit(&self, request: VfsRequest) -> Result<(), StorageError> {
        self.mirror
            .items
            .lock()
            .expect("queue mirror lock")
            .push_back(request.describe());
        self.tx
            .send(QueuedRequest {
                request,
                queued: Instant::now(),
            })
            .map_err(|_| {
                self.mirror
                    .items
                    .lock()
                    .expect("queue mirror lock")
                    .pop_back();
                StorageError::WorkerGone
            })
    }

    pub fn existence_index(&self) -> &Arc<ExistenceIndex> {
        &self.index
    }

    /// True iff the existence index knows the id. Never touches disk.
    pub fn exists(&self, id: &AssetId) -> bool {
        self.index.contains(id)
    }

    pub async fn get(&self, id: &AssetId) -> Result<Asset, StorageError> {
        // Assets the index has never heard of skip the disk queue entirely.
        if !self.index.contains(id) {
            return Err(StorageError::NotFound(*id));
        }
        let (reply, rx) = oneshot::channel();
        self.submit(VfsRequest::Get { id: *id, reply })?;
        rx.await.map_err(|_| StorageError::WorkerGone)?
    }

    /// Stores `asset`, reserving its id in the existence index up front so
    /// that a GET issued immediately after this call serializes behind the
    /// write in the disk queue. The reservation is rolled back on failure.
    pub async fn put(&self, asset: Asset) -> Result<(), StorageError> {
        let id = asset.id();
        if !self.index.insert(&id) {
            return Err(StorageError::AlreadyExists(id));
        }

        let (reply, rx) = oneshot::channel();
        if let Err(err) = self.submit(VfsRequest::Put { asset, reply }) {
            self.index.remove(&id);
            return Err(err);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(StorageError::WorkerGone),
        }
    }

    pub async fn purge(&self, id: &AssetId) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.submit(VfsRequest::Purge { id: *id, reply })?;
        rx.await.map_err(|_| StorageError::WorkerGone)?
    }

    /// Kicks off the background purge of every local asset. One shard is
    /// processed per second; a run already in progress is left alone.
    pub fn begin_purge_locals(&self) {
        if self.purging.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("purge-locals command received, beginning purge");

        let handle = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PURGE_TICK);
            for shard in 0..SHARD_COUNT {
                tick.tick().await;
                let prefix = format!("{shard:03x}");
                tracing::info!(%prefix, "queueing purge of locals");

                match handle.collect_local_ids(prefix.clone()).await {
                    Ok(ids) => {
                        for id in &ids {
                            handle.index.remove(id);
                        }
                        if handle
                            .submit(VfsRequest::DeleteLocalStorage { prefix })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(StorageError::WorkerGone) => break,
                    Err(err) => {
                        tracing::error!(%prefix, %err, "failed to collect local asset ids")
                    }
                }
            }
            handle.purging.store(false, Ordering::SeqCst);
        });
    }

    async fn collect_local_ids(&self, prefix: String) -> Result<Vec<AssetId>, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.submit(VfsRequest::CollectLocalIds { prefix, reply })?;
        rx.await.map_err(|_| StorageError::WorkerGone)?
    }

    /// The backend's section of the status report, as assembled by the
    /// worker so that it reflects the queue it is actually draining.
    pub async fn status_report(&self) -> Result<String, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.submit(VfsRequest::CollectStatus { reply })?;
        rx.await.map_err(|_| StorageError::WorkerGone)
    }

    /// The comma-terminated id list of one shard's globals index.
    pub async fn stored_ids(&self, prefix: &str) -> Result<String, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.submit(VfsRequest::StoredIds {
            prefix: prefix.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StorageError::WorkerGone)?
    }
}

fn work_loop(
    root: PathBuf,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    index: Arc<ExistenceIndex>,
    mirror: Arc<QueueMirror>,
    store_hook: Option<StoreHook>,
) {
    let mut worker = Worker {
        root,
        index,
        pool: IndexFilePool::new(),
        store_hook,
        wait_avg: MovingAverage::new(LATENCY_SAMPLE_SIZE),
        op_avg: MovingAverage::new(LATENCY_SAMPLE_SIZE),
        mirror,
    };

    while let Some(QueuedRequest { request, queued }) = rx.blocking_recv() {
        worker
            .mirror
            .items
            .lock()
            .expect("queue mirror lock")
            .pop_front();

        if matches!(request, VfsRequest::Shutdown) {
            break;
        }

        worker.wait_avg.add_sample(queued.elapsed().as_millis() as u64);
        let started = Instant::now();

        // A panic inside one request must not take the worker down with it;
        // the reply channel drop tells the waiter the operation died.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            worker.process(request)
        }));
        if let Err(panic) = outcome {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown error".to_string());
            tracing::error!(%reason, "disk worker caught panic while processing request");
        }

        worker.op_avg.add_sample(started.elapsed().as_millis() as u64);
    }

    worker.pool.clear();
    tracing::info!("disk worker exited, indexes closed");
}

struct Worker {
    root: PathBuf,
    index: Arc<ExistenceIndex>,
    pool: IndexFilePool,
    store_hook: Option<StoreHook>,
    wait_avg: MovingAverage,
    op_avg: MovingAverage,
    mirror: Arc<QueueMirror>,
}

impl Worker {
    fn process(&mut self, request: VfsRequest) {
        match request {
            VfsRequest::Get { id, reply } => {
                let _ = reply.send(self.get(&id));
            }
            VfsRequest::Put { asset, reply } => {
                let _ = reply.send(self.put(asset));
            }
            VfsRequest::Purge { id: _, reply } => {
                let _ = reply.send(Ok(()));
            }
            VfsRequest::CollectLocalIds { prefix, reply } => {
                let _ = reply.send(self.collect_local_ids(&prefix));
            }
            VfsRequest::DeleteLocalStorage { prefix } => {
                if let Err(err) = self.delete_local_storage(&prefix) {
                    tracing::error!(%prefix, %err, "failed to delete local storage");
                }
            }
            VfsRequest::CollectStatus { reply } => {
                let _ = reply.send(self.status());
            }
            VfsRequest::StoredIds { prefix, reply } => {
                let _ = reply.send(self.stored_ids(&prefix));
            }
            VfsRequest::Shutdown => {}
        }
    }

    fn shard_dir(&self, prefix: &str) -> PathBuf {
        self.root.join(prefix)
    }

    fn get(&mut self, id: &AssetId) -> Result<Asset, StorageError> {
        let set = DatabaseSet::new(self.shard_dir(id.shard_prefix()));
        match set.get(&mut self.pool, id)? {
            Some(asset) => Ok(asset),
            None => Err(StorageError::NotFound(*id)),
        }
    }

    fn put(&mut self, asset: Asset) -> Result<(), StorageError> {
        let result = self.try_put(&asset);
        match &result {
            Ok(()) => {
                if let Some(hook) = &self.store_hook {
                    hook(asset);
                }
            }
            Err(err) => {
                // The id was reserved before the request was queued; a
                // failed write must release it again.
                self.index.remove(&asset.id());
                tracing::error!(id = %asset.id(), %err, "asset write failed");
            }
        }
        result
    }

    fn try_put(&mut self, asset: &Asset) -> Result<(), StorageError> {
        let dir = self.shard_dir(asset.id().shard_prefix());
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        DatabaseSet::new(dir).store(&mut self.pool, asset)?;
        Ok(())
    }

    fn collect_local_ids(&mut self, prefix: &str) -> Result<Vec<AssetId>, StorageError> {
        let index_path = self.shard_dir(prefix).join(format!("{LOCALS_BASE}.idx"));
        if !index_path.exists() {
            return Ok(Vec::new());
        }
        let ids = self.pool.open(&index_path)?.contained_ids()?;
        Ok(ids
            .iter()
            .filter_map(|id| id.parse::<AssetId>().ok())
            .collect())
    }

    fn delete_local_storage(&mut self, prefix: &str) -> Result<(), StorageError> {
        let dir = self.shard_dir(prefix);
        let index_path = dir.join(format!("{LOCALS_BASE}.idx"));
        self.pool.force_close(&index_path);

        for path in [index_path, dir.join(format!("{LOCALS_BASE}.data"))] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn status(&self) -> String {
        let items: Vec<String> = {
            let mirror = self.mirror.items.lock().expect("queue mirror lock");
            mirror.iter().cloned().collect()
        };

        let mut out = String::new();
        writeln!(out, "-VFS Backend").unwrap();
        writeln!(out, "  Disk queue size: {}", items.len()).unwrap();
        writeln!(out, "  Avg Disk Queue Wait: {} ms", self.wait_avg.average()).unwrap();
        writeln!(out, "  Avg Disk Op Latency: {} ms", self.op_avg.average()).unwrap();
        writeln!(out, "-VFS Queue Items").unwrap();
        for item in items {
            writeln!(out, "  {item}").unwrap();
        }
        out
    }

    fn stored_ids(&mut self, prefix: &str) -> Result<String, StorageError> {
        let index_path = self.shard_dir(prefix).join(format!("{GLOBALS_BASE}.idx"));
        if !index_path.exists() {
            return Ok(String::new());
        }
        let ids = self.pool.open(&index_path)?.contained_ids()?;
        let mut out = String::with_capacity(ids.len() * 33);
        for id in ids {
            out.push_str(&id);
            out.push(',');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::asset_bytes;

    fn asset(id: &str, local: bool, payload: &[u8]) -> Asset {
        Asset::from_bytes(asset_bytes(id, 1, local, payload)).unwrap()
    }

    #[test]
    fn moving_average_windows() {
        let mut avg = MovingAverage::new(3);
        assert_eq!(avg.average(), 0);
        avg.add_sample(10);
        assert_eq!(avg.average(), 10);
        avg.add_sample(20);
        avg.add_sample(30);
        assert_eq!(avg.average(), 20);
        // Window slides: the 10 falls out.
        avg.add_sample(40);
        assert_eq!(avg.average(), 30);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = VfsBackend::start(dir.path(), None).unwrap();
        let vfs = backend.handle();

        let a = asset("0123456789abcdef0123456789abcdef", false, &[0xAA; 66]);
        vfs.put(a.clone()).await.unwrap();

        assert!(vfs.exists(&a.id()));
        let fetched = vfs.get(&a.id()).await.unwrap();
        assert_eq!(fetched.data(), a.data());

        // Scenario from the on-disk contract: shard 012, magic header,
        // record at position 8.
        let raw = std::fs::read(dir.path().join("012").join("globals.data")).unwrap();
        assert_eq!(&raw[..8], b"IWZDDB01");
        assert_eq!(&raw[8..12], &[0, 0, 0, 100]);

        backend.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_put_is_rejected_without_disk_change() {
        let dir = tempfile::tempdir().unwrap();
        let backend = VfsBackend::start(dir.path(), None).unwrap();
        let vfs = backend.handle();

        let a = asset("0123456789abcdef0123456789abcdef", false, b"payload");
        vfs.put(a.clone()).await.unwrap();
        let len_before = std::fs::metadata(dir.path().join("012").join("globals.data"))
            .unwrap()
            .len();

        let err = vfs.put(a.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert!(!err.is_critical());

        let len_after = std::fs::metadata(dir.path().join("012").join("globals.data"))
            .unwrap()
            .len();
        assert_eq!(len_before, len_after);

        // The original copy is still readable.
        assert!(vfs.get(&a.id()).await.is_ok());
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn get_of_unknown_id_misses_without_disk_io() {
        let dir = tempfile::tempdir().unwrap();
        let backend = VfsBackend::start(dir.path(), None).unwrap();
        let vfs = backend.handle();

        let id = "ffffffffffffffffffffffffffffffff".parse().unwrap();
        assert!(matches!(
            vfs.get(&id).await,
            Err(StorageError::NotFound(_))
        ));
        // No shard directory was created by the read.
        assert!(!dir.path().join("fff").exists());
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn existing_assets_are_indexed_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let a = asset("0123456789abcdef0123456789abcdef", false, b"persisted");
        {
            let backend = VfsBackend::start(dir.path(), None).unwrap();
            backend.handle().put(a.clone()).await.unwrap();
            backend.shutdown().await;
        }

        let backend = VfsBackend::start(dir.path(), None).unwrap();
        let vfs = backend.handle();
        assert!(vfs.exists(&a.id()));
        assert_eq!(vfs.get(&a.id()).await.unwrap().data(), a.data());
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn purge_is_an_acknowledged_noop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = VfsBackend::start(dir.path(), None).unwrap();
        let vfs = backend.handle();

        let a = asset("0123456789abcdef0123456789abcdef", false, b"kept");
        vfs.put(a.clone()).await.unwrap();
        vfs.purge(&a.id()).await.unwrap();

        assert!(vfs.exists(&a.id()));
        assert!(vfs.get(&a.id()).await.is_ok());
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn stored_ids_lists_globals_with_trailing_commas() {
        let dir = tempfile::tempdir().unwrap();
        let backend = VfsBackend::start(dir.path(), None).unwrap();
        let vfs = backend.handle();

        vfs.put(asset("012aaaaaaaaaaaaaaaaaaaaaaaaaaaaa", false, b"x"))
            .await
            .unwrap();
        vfs.put(asset("012bbbbbbbbbbbbbbbbbbbbbbbbbbbbb", false, b"x"))
            .await
            .unwrap();
        // Locals are invisible to stored-ids.
        vfs.put(asset("012ccccccccccccccccccccccccccccc", true, b"x"))
            .await
            .unwrap();

        let ids = vfs.stored_ids("012").await.unwrap();
        let listed: Vec<&str> = ids.split(',').filter(|s| !s.is_empty()).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&"012aaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(listed.contains(&"012bbbbbbbbbbbbbbbbbbbbbbbbbbbbb"));
        assert!(ids.ends_with(','));

        assert_eq!(vfs.stored_ids("fff").await.unwrap(), "");
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn store_hook_sees_successful_puts_only() {
        let dir = tempfile::tempdir().unwrap();
        let stored: Arc<Mutex<Vec<AssetId>>> = Arc::new(Mutex::new(Vec::new()));
        let hook_log = stored.clone();
        let backend = VfsBackend::start(
            dir.path(),
            Some(Box::new(move |asset| {
                hook_log.lock().unwrap().push(asset.id());
            })),
        )
        .unwrap();
        let vfs = backend.handle();

        let a = asset("0123456789abcdef0123456789abcdef", false, b"x");
        vfs.put(a.clone()).await.unwrap();
        let _ = vfs.put(a.clone()).await; // duplicate, must not re-fire

        backend.shutdown().await;
        assert_eq!(stored.lock().unwrap().as_slice(), &[a.id()]);
    }

    #[tokio::test]
    async fn status_report_has_backend_sections() {
        let dir = tempfile::tempdir().unwrap();
        let backend = VfsBackend::start(dir.path(), None).unwrap();

        let report = backend.handle().status_report().await.unwrap();
        assert!(report.contains("-VFS Backend"));
        assert!(report.contains("Disk queue size:"));
        assert!(report.contains("Avg Disk Queue Wait:"));
        assert!(report.contains("-VFS Queue Items"));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn purge_locals_deletes_local_files_and_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = VfsBackend::start(dir.path(), None).unwrap();
        let vfs = backend.handle();

        let local = asset("000aaaaaaaaaaaaaaaaaaaaaaaaaaaaa", true, b"private");
        let global = asset("000bbbbbbbbbbbbbbbbbbbbbbbbbbbbb", false, b"shared");
        vfs.put(local.clone()).await.unwrap();
        vfs.put(global.clone()).await.unwrap();

        // Drive the first shard's purge directly through the same steps the
        // background run takes, so the test does not sleep through the
        // 4096-second sweep.
        let ids = vfs.collect_local_ids("000".to_string()).await.unwrap();
        assert_eq!(ids, vec![local.id()]);
        for id in &ids {
            vfs.index.remove(id);
        }
        vfs.submit(VfsRequest::DeleteLocalStorage {
            prefix: "000".to_string(),
        })
        .unwrap();

        // A queued no-op marks the deletion as processed once it answers.
        vfs.purge(&global.id()).await.unwrap();

        assert!(!dir.path().join("000").join("locals.idx").exists());
        assert!(!dir.path().join("000").join("locals.data").exists());
        assert!(dir.path().join("000").join("globals.data").exists());

        assert!(!vfs.exists(&local.id()));
        assert!(matches!(
            vfs.get(&local.id()).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(vfs.get(&global.id()).await.unwrap().data(), global.data());
        backend.shutdown().await;
    }
}
