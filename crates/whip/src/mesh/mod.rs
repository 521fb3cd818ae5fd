//! The intramesh subsystem: a query listener answering peers' existence
//! probes, outbound peer connections with heartbeat tracking, and the
//! distributed first-found-wins asset search.

pub mod codec;
pub mod peer;
pub mod search;

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use whip_proto::mesh::{flags, MeshMsg, QueryResult};
use whip_proto::AssetId;
use whip_vfs::{Asset, AssetCache, ExistenceIndex};

use crate::config::{Config, ConfigHandle};
use crate::stats::ServerStats;
use codec::MeshCodec;
use peer::MeshPeer;
pub use search::QUERY_TIMEOUT;

/// Interval between heartbeats, configuration reloads and peer redials.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A peer silent for this long is considered unreachable.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// The capability flags this node advertises.
pub fn heartbeat_flags(config: &Config) -> u32 {
    let mut flags = flags::ONLINE | flags::READABLE;
    if config.is_writable {
        flags |= flags::WRITABLE;
    }
    flags
}

pub struct MeshService {
    config: Arc<ConfigHandle>,
    index: Arc<ExistenceIndex>,
    stats: Arc<ServerStats>,
    cache: Option<Arc<AssetCache>>,
    peers: Mutex<HashMap<String, Arc<MeshPeer>>>,
    connecting: Mutex<HashSet<String>>,
    active_searches: Mutex<HashMap<u64, AssetId>>,
    next_token: AtomicU64,
    cancel: CancellationToken,
}

impl MeshService {
    pub fn new(
        config: Arc<ConfigHandle>,
        index: Arc<ExistenceIndex>,
        stats: Arc<ServerStats>,
        cache: Option<Arc<AssetCache>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(MeshService {
            config,
            index,
            stats,
            cache,
            peers: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            active_searches: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            cancel,
        })
    }

    /// Binds the query listener and starts the accept and heartbeat loops.
    /// Returns the bound address (the configured port may be 0 in tests).
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        let port = self.config.snapshot().intramesh_port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind intramesh port {port}"))?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "intramesh starting");

        let service = self.clone();
        tokio::spawn(async move { service.accept_loop(listener).await });

        let service = self.clone();
        tokio::spawn(async move { service.heartbeat_loop().await });

        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "error during accept on intramesh listener");
                    continue;
                }
            };

            if !self.is_trusted(&addr.ip().to_string()) {
                tracing::warn!(%addr, "rejecting untrusted intramesh connection");
                continue;
            }
            tracing::info!(%addr, "accepted query connection from server");

            let service = self.clone();
            tokio::spawn(async move { service.serve_query_connection(stream, addr).await });
        }
    }

    /// Inbound connections must originate from a configured peer address.
    fn is_trusted(&self, remote_ip: &str) -> bool {
        self.config
            .snapshot()
            .intramesh_peers
            .iter()
            .any(|peer| peer.host == remote_ip)
    }

    /// Serves one inbound query connection: answers QUERYs from the
    /// existence index and pushes this node's heartbeat every tick.
    async fn serve_query_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        crate::remote::set_socket_buffers(&stream, self.config.snapshot().tcp_bufsz);

        let mut framed = Framed::new(stream, MeshCodec);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = heartbeat.tick() => {
                    let flags = heartbeat_flags(&self.config.snapshot());
                    if framed.send(MeshMsg::Heartbeat { flags }).await.is_err() {
                        break;
                    }
                }
                msg = framed.next() => {
                    match msg {
                        Some(Ok(MeshMsg::Query { id })) => {
                            self.stats.add_mesh_request();
                            let result = if self.index.contains(&id) {
                                QueryResult::Found
                            } else {
                                QueryResult::NotFound
                            };
                            tracing::debug!(%id, %addr, ?result, "answering mesh query");
                            if framed.send(MeshMsg::Response { id, result }).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(other)) => {
                            tracing::error!(%addr, ?other, "unexpected message on inbound query connection");
                            break;
                        }
                        Some(Err(err)) => {
                            tracing::error!(%addr, %err, "invalid intramesh message");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::info!(%addr, "query client disconnect");
    }

    /// Every 5 seconds: reload configuration and dial configured peers that
    /// are not connected. (Heartbeats travel the other way: each inbound
    /// query connection pushes this node's flags to the peer that dialed it.)
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            self.config.reload();
            let config = self.config.snapshot();

            for entry in &config.intramesh_peers {
                self.ensure_peer_connection(entry.clone(), &config);
            }

            // Peers edited out of the configuration are closed; their reaper
            // tasks remove them from the map.
            let configured: HashSet<String> = config
                .intramesh_peers
                .iter()
                .map(|entry| entry.query_addr())
                .collect();
            let stale: Vec<Arc<MeshPeer>> = self
                .peers
                .lock()
                .expect("mesh peers lock")
                .values()
                .filter(|peer| !configured.contains(&peer.query_addr()))
                .cloned()
                .collect();
            for peer in stale {
                tracing::info!(peer = %peer.query_addr(), "dropping unconfigured mesh peer");
                peer.close();
            }
        }

        // Shutdown: drop every peer and fail their waiters.
        let peers: Vec<Arc<MeshPeer>> = self
            .peers
            .lock()
            .expect("mesh peers lock")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.close();
        }
    }

    fn ensure_peer_connection(self: &Arc<Self>, entry: crate::config::PeerEntry, config: &Config) {
        let key = entry.query_addr();
        if self.peers.lock().expect("mesh peers lock").contains_key(&key) {
            return;
        }
        if !self
            .connecting
            .lock()
            .expect("mesh connecting lock")
            .insert(key.clone())
        {
            return;
        }

        let service = self.clone();
        let password = config.password.clone();
        let tcp_bufsz = config.tcp_bufsz;
        tokio::spawn(async move {
            let connected = MeshPeer::connect(entry, &password, tcp_bufsz).await;
            service
                .connecting
                .lock()
                .expect("mesh connecting lock")
                .remove(&key);

            match connected {
                Ok(peer) => {
                    tracing::info!(peer = %key, "connected to intramesh server");
                    service
                        .peers
                        .lock()
                        .expect("mesh peers lock")
                        .insert(key.clone(), peer.clone());

                    // Reap the entry once the peer dies, unless a newer
                    // connection already replaced it.
                    let service = service.clone();
                    tokio::spawn(async move {
                        peer.wait_closed().await;
                        let mut peers = service.peers.lock().expect("mesh peers lock");
                        if let Some(current) = peers.get(&key) {
                            if Arc::ptr_eq(current, &peer) {
                                peers.remove(&key);
                            }
                        }
                        tracing::info!(peer = %key, "mesh peer disconnected");
                    });
                }
                Err(err) => {
                    tracing::error!(peer = %key, %err, "unable to connect to intramesh peer");
                }
            }
        });
    }

    /// Alive, readable peers in a freshly shuffled visit order, so replicas
    /// of a popular asset absorb searches evenly.
    fn searchable_peers(&self) -> Vec<Arc<MeshPeer>> {
        let mut peers: Vec<Arc<MeshPeer>> = self
            .peers
            .lock()
            .expect("mesh peers lock")
            .values()
            .filter(|peer| peer.is_searchable())
            .cloned()
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers
    }

    async fn run_search(&self, id: AssetId) -> Option<Arc<MeshPeer>> {
        let peers = self.searchable_peers();
        if peers.is_empty() {
            return None;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.active_searches
            .lock()
            .expect("mesh searches lock")
            .insert(token, id);
        let winner = search::run(id, token, peers).await;
        self.active_searches
            .lock()
            .expect("mesh searches lock")
            .remove(&token);

        if winner.is_some() {
            self.stats.add_mesh_positive();
        }
        winner
    }

    /// Existence-only search: does any peer hold `id`?
    pub async fn test(&self, id: AssetId) -> bool {
        self.run_search(id).await.is_some()
    }

    /// Full search: find a peer holding `id` and fetch the asset from it.
    /// A successful fetch is offered to the cache but never hits this
    /// node's disk.
    pub async fn fetch(&self, id: AssetId) -> Option<Asset> {
        let peer = self.run_search(id).await?;
        let asset = peer.fetch(id).await;
        if let (Some(asset), Some(cache)) = (&asset, &self.cache) {
            cache.inform(asset);
        }
        asset
    }

    /// The mesh sections of the status report.
    pub fn status_report(&self, out: &mut String) {
        let searches: Vec<AssetId> = self
            .active_searches
            .lock()
            .expect("mesh searches lock")
            .values()
            .copied()
            .collect();
        writeln!(out, "-Mesh Backend").unwrap();
        writeln!(out, "  Search Queue Size: {}", searches.len()).unwrap();
        writeln!(out, "-Active Mesh Searches").unwrap();
        for id in searches {
            writeln!(out, "  {id} SEARCHING").unwrap();
        }

        let peers: Vec<String> = self
            .peers
            .lock()
            .expect("mesh peers lock")
            .values()
            .map(|peer| peer.description())
            .collect();
        writeln!(out, "-Intramesh Service").unwrap();
        writeln!(out, "  Connected Servers: {}", peers.len()).unwrap();
        writeln!(out, "-Intramesh Topology").unwrap();
        for description in peers {
            writeln!(out, "  {description}").unwrap();
        }
    }
}
