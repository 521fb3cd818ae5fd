//! Listener, subsystem wiring and the periodic stats report.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use whip_vfs::{AssetCache, VfsBackend};

use crate::config::{Config, ConfigHandle};
use crate::mesh::MeshService;
use crate::replication::{PullReplication, PushReplication};
use crate::session;
use crate::stats::ServerStats;
use crate::store::AssetStore;

const STAT_TIMER_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a client session needs, shared across connections.
pub struct App {
    pub config: Arc<ConfigHandle>,
    pub store: AssetStore,
    pub mesh: Arc<MeshService>,
    pub stats: Arc<ServerStats>,
}

pub struct AssetServer {
    app: Arc<App>,
    backend: VfsBackend,
    listener: TcpListener,
    client_addr: SocketAddr,
    mesh_addr: SocketAddr,
    cancel: CancellationToken,
    pull: tokio::task::JoinHandle<()>,
}

impl AssetServer {
    /// Wires up storage, cache, mesh and replication, and binds both
    /// listeners. `config_path` enables periodic reloads; tests pass `None`
    /// to pin the configuration.
    pub async fn bind(
        config: Config,
        config_path: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let config = ConfigHandle::new(config, config_path);
        let cfg = config.snapshot();

        let stats = Arc::new(ServerStats::default());

        // Push replication is created first so the disk worker can hand it
        // every successful store.
        let push = PushReplication::start(config.clone(), cancel.child_token());
        let store_hook = push.store_hook();

        let root = cfg.disk_storage_root.clone();
        let backend =
            tokio::task::spawn_blocking(move || VfsBackend::start(root, Some(store_hook)))
                .await
                .context("storage backend start was aborted")??;

        let cache = cfg
            .cache_enabled
            .then(|| Arc::new(AssetCache::new(cfg.cache_bytes())));
        let store = AssetStore::new(backend.handle(), cache.clone());

        let mesh = MeshService::new(
            config.clone(),
            backend.handle().existence_index().clone(),
            stats.clone(),
            cache,
            cancel.child_token(),
        );
        let mesh_addr = mesh.start().await?;

        let pull = PullReplication::spawn(config.clone(), backend.handle(), cancel.child_token());

        let listener = TcpListener::bind(("0.0.0.0", cfg.port))
            .await
            .with_context(|| format!("failed to bind client service port {}", cfg.port))?;
        let client_addr = listener.local_addr()?;
        tracing::info!(%client_addr, "starting asset services");

        Ok(AssetServer {
            app: Arc::new(App {
                config,
                store,
                mesh,
                stats,
            }),
            backend,
            listener,
            client_addr,
            mesh_addr,
            cancel,
            pull,
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn mesh_addr(&self) -> SocketAddr {
        self.mesh_addr
    }

    /// Accepts client connections until the cancellation token fires, then
    /// runs the orderly shutdown: stop accepting, stop replication, drain
    /// the disk queue.
    pub async fn serve(self) -> anyhow::Result<()> {
        let stats = self.app.stats.clone();
        tokio::spawn(stats_loop(stats, self.cancel.clone()));

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    tracing::info!(%addr, "new client connection");
                    let _ = stream.set_nodelay(true);
                    let app = self.app.clone();
                    let cancel = self.cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = session::serve(app, stream, addr, cancel).await {
                            tracing::debug!(%addr, %err, "session ended with error");
                        }
                    });
                }
                Err(err) => {
                    tracing::error!(%err, "error during accept on client connect");
                }
            }
        }

        drop(self.listener);
        // Replication exits on the cancellation token; don't let a wedged
        // remote hold the whole shutdown hostage.
        let _ = tokio::time::timeout(Duration::from_secs(5), self.pull).await;
        self.backend.shutdown().await;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Logs request and transfer rates from the reset-on-read counters.
async fn stats_loop(stats: Arc<ServerStats>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(STAT_TIMER_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // the first tick completes immediately
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        let elapsed = last.elapsed().as_secs();
        if elapsed == 0 {
            continue;
        }
        last = Instant::now();

        let sample = stats.take();
        tracing::info!(
            "[STATS](Client) Requests/sec: {}, Data Rate: {}kB/sec",
            sample.requests / elapsed,
            sample.kb_transferred / elapsed,
        );
        tracing::info!(
            "[STATS](Mesh) #Requests: {} ({}/sec), Positive Req: {}, Data Rate: {}kB/sec",
            sample.mesh_requests,
            sample.mesh_requests / elapsed,
            sample.mesh_positive,
            sample.mesh_kb_transferred / elapsed,
        );
    }
}
