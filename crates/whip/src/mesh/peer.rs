use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use whip_proto::mesh::{flags, MeshMsg, QueryResult};
use whip_proto::AssetId;
use whip_vfs::Asset;

use crate::config::PeerEntry;
use crate::mesh::codec::MeshCodec;
use crate::mesh::HEARTBEAT_TIMEOUT;
use crate::remote::{set_socket_buffers, AssetServiceClient};

/// Answer delivered to a search: which peer answered, and whether it holds
/// the asset.
pub(crate) type SearchReply = (Arc<MeshPeer>, bool);

struct PendingQuery {
    token: u64,
    reply: mpsc::UnboundedSender<SearchReply>,
}

struct PeerStatus {
    last_heartbeat: Instant,
    flags: u32,
}

/// One connected mesh peer: a query connection speaking the 38-byte
/// intramesh protocol, and an authenticated asset-service connection used to
/// fetch winning search results. Searches hold a peer `Arc` only while they
/// run; the peer holds only reply senders into live searches, so no
/// reference cycle outlives a search.
pub struct MeshPeer {
    entry: PeerEntry,
    status: Mutex<PeerStatus>,
    query_tx: mpsc::UnboundedSender<MeshMsg>,
    pending: Mutex<HashMap<AssetId, Vec<PendingQuery>>>,
    asset_client: AssetServiceClient,
    closed: CancellationToken,
}

impl MeshPeer {
    /// Dials both connections. Either one failing fails the whole peer; a
    /// half-connected peer is useless to searches.
    pub async fn connect(
        entry: PeerEntry,
        password: &str,
        tcp_bufsz: usize,
    ) -> anyhow::Result<Arc<Self>> {
        let asset_client = AssetServiceClient::connect(&entry.asset_addr(), password, tcp_bufsz)
            .await
            .with_context(|| {
                format!(
                    "unable to connect to asset service on intramesh server {}",
                    entry.asset_addr()
                )
            })?;

        let query_stream = TcpStream::connect(entry.query_addr())
            .await
            .with_context(|| {
                format!(
                    "unable to connect to query service on intramesh server {}",
                    entry.query_addr()
                )
            })?;
        query_stream.set_nodelay(true)?;
        set_socket_buffers(&query_stream, tcp_bufsz);

        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MeshPeer {
            entry,
            // Fresh peers count as alive and readable until their first
            // heartbeat proves otherwise.
            status: Mutex::new(PeerStatus {
                last_heartbeat: Instant::now(),
                flags: flags::ONLINE | flags::READABLE,
            }),
            query_tx,
            pending: Mutex::new(HashMap::new()),
            asset_client,
            closed: CancellationToken::new(),
        });

        tokio::spawn(query_loop(peer.clone(), query_stream, query_rx));

        // Losing the asset-service connection makes search wins unfetchable;
        // treat it as losing the peer.
        let watcher = peer.clone();
        tokio::spawn(async move {
            watcher.asset_client.wait_closed().await;
            watcher.close();
        });

        Ok(peer)
    }

    pub fn query_addr(&self) -> String {
        self.entry.query_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Eligible to receive search queries: connected, heartbeat fresh, and
    /// advertising the readable flag.
    pub fn is_searchable(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        let status = self.status.lock().expect("peer status lock");
        status.last_heartbeat.elapsed() <= HEARTBEAT_TIMEOUT && status.flags & flags::READABLE != 0
    }

    pub fn heartbeat_flags(&self) -> u32 {
        self.status.lock().expect("peer status lock").flags
    }

    /// Registers a search and sends the QUERY, deduplicating against other
    /// searches for the same id already in flight on this peer.
    pub fn submit_search(
        self: &Arc<Self>,
        id: AssetId,
        token: u64,
        reply: mpsc::UnboundedSender<SearchReply>,
    ) {
        if self.closed.is_cancelled() {
            let _ = reply.send((self.clone(), false));
            return;
        }

        let first_for_id = {
            let mut pending = self.pending.lock().expect("peer pending lock");
            let entry = pending.entry(id).or_default();
            let first = entry.is_empty();
            entry.push(PendingQuery { token, reply });
            first
        };

        if first_for_id && self.query_tx.send(MeshMsg::Query { id }).is_err() {
            self.answer_pending(id, false);
        }
    }

    /// Withdraws a search locally. Nothing is sent on the wire; a late
    /// RESPONSE for the id simply finds nobody waiting.
    pub fn cancel_search(&self, id: &AssetId, token: u64) {
        let mut pending = self.pending.lock().expect("peer pending lock");
        if let Some(waiters) = pending.get_mut(id) {
            waiters.retain(|waiter| waiter.token != token);
            if waiters.is_empty() {
                pending.remove(id);
            }
        }
    }

    /// Fetches the asset over the asset-service connection after a positive
    /// query answer. Failure yields `None`; the connection-level teardown
    /// rules live in the client.
    pub async fn fetch(&self, id: AssetId) -> Option<Asset> {
        match self.asset_client.get(id, true).await {
            Ok(asset) => Some(asset),
            Err(err) => {
                tracing::error!(peer = %self.query_addr(), %id, %err, "mesh asset fetch failed");
                None
            }
        }
    }

    fn handle_message(self: &Arc<Self>, msg: MeshMsg) {
        match msg {
            MeshMsg::Heartbeat { flags } => {
                let mut status = self.status.lock().expect("peer status lock");
                status.last_heartbeat = Instant::now();
                status.flags = flags;
            }
            MeshMsg::Response { id, result } => {
                self.answer_pending(id, result == QueryResult::Found);
            }
            MeshMsg::Query { id } => {
                // Queries belong on the inbound service, not on a connection
                // this node initiated.
                tracing::error!(peer = %self.query_addr(), %id, "unexpected QUERY on outbound query connection");
            }
        }
    }

    fn answer_pending(self: &Arc<Self>, id: AssetId, found: bool) {
        let waiters = self.pending.lock().expect("peer pending lock").remove(&id);
        for waiter in waiters.unwrap_or_default() {
            let _ = waiter.reply.send((self.clone(), found));
        }
    }

    /// Tears the peer down: both connections close and every waiting search
    /// receives a negative answer so nobody leaks.
    pub fn close(self: &Arc<Self>) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.asset_client.close();

        let ids: Vec<AssetId> = self
            .pending
            .lock()
            .expect("peer pending lock")
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.answer_pending(id, false);
        }
    }

    /// One line for the intramesh topology section of the status report.
    pub fn description(&self) -> String {
        let state = if self.closed.is_cancelled() {
            "DEAD"
        } else {
            "CONNECTED"
        };
        format!(
            "{} {state}, FLGS: {}, Active Searches: {}",
            self.query_addr(),
            self.heartbeat_flags(),
            self.pending.lock().expect("peer pending lock").len(),
        )
    }
}

async fn query_loop(
    peer: Arc<MeshPeer>,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<MeshMsg>,
) {
    let mut framed = Framed::new(stream, MeshCodec);
    loop {
        tokio::select! {
            _ = peer.closed.cancelled() => break,
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(err) = framed.send(msg).await {
                    tracing::error!(peer = %peer.query_addr(), %err, "query connection write failed");
                    break;
                }
            }
            msg = framed.next() => {
                match msg {
                    Some(Ok(msg)) => peer.handle_message(msg),
                    Some(Err(err)) => {
                        tracing::error!(peer = %peer.query_addr(), %err, "invalid intramesh message");
                        break;
                    }
                    None => {
                        tracing::info!(peer = %peer.query_addr(), "query connection closed");
                        break;
                    }
                }
            }
        }
    }
    peer.close();
}
