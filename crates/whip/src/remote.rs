//! Client side of the asset-service protocol, shared by mesh peers and both
//! replication roles.
//!
//! The connection authenticates with the server identifier so the remote
//! side treats it as another WHIP node and answers from local storage only.
//! Requests pipeline: a writer task sends headers as they are submitted and
//! a reader task matches responses against the FIFO of pending requests.
//! Responses arrive in request order by protocol contract; a response whose
//! embedded id does not match the queue head is a protocol violation that
//! tears the connection down and fails every waiter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use whip_proto::auth::{AuthChallenge, AuthResponse, AuthStatus, Ident, CHALLENGE_SIZE, STATUS_SIZE};
use whip_proto::client::{
    RequestHeader, RequestType, ResponseCode, ResponseHeader, RESPONSE_HEADER_SIZE,
};
use whip_proto::AssetId;
use whip_vfs::Asset;

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Failure of a single request against a remote asset service.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("asset not found on remote")]
    NotFound,

    #[error("remote reported an error: {0}")]
    Remote(String),

    #[error("connection to remote asset service lost")]
    Disconnected,
}

enum Expectation {
    /// A GET: FOUND with a payload whose embedded id must match.
    Asset { id: AssetId },
    /// A PUT acknowledgement.
    PutAck,
    /// A textual payload (stored-ids listings).
    Text,
}

enum Outcome {
    Asset(Asset),
    Ack,
    Text(String),
}

struct Pending {
    expect: Expectation,
    reply: oneshot::Sender<Result<Outcome, FetchError>>,
}

struct Command {
    header: [u8; whip_proto::client::REQUEST_HEADER_SIZE],
    payload: Option<Bytes>,
    pending: Pending,
}

/// Applies the configured `tcp_bufsz` to a stream's kernel buffers.
pub fn set_socket_buffers(stream: &TcpStream, size: usize) {
    let sock = socket2::SockRef::from(stream);
    if let Err(err) = sock.set_send_buffer_size(size) {
        tracing::debug!(%err, "failed to set send buffer size");
    }
    if let Err(err) = sock.set_recv_buffer_size(size) {
        tracing::debug!(%err, "failed to set receive buffer size");
    }
}

#[derive(Clone)]
pub struct AssetServiceClient {
    tx: mpsc::UnboundedSender<Command>,
    closed: CancellationToken,
    peer: Arc<String>,
}

impl AssetServiceClient {
    /// Dials `addr` and runs the full authentication handshake before
    /// returning. Fails on connection errors, handshake framing errors, or
    /// rejected credentials.
    pub async fn connect(addr: &str, password: &str, tcp_bufsz: usize) -> anyhow::Result<Self> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("connection to asset service at {addr} timed out"))?
            .with_context(|| format!("unable to connect to asset service at {addr}"))?;
        stream.set_nodelay(true)?;
        set_socket_buffers(&stream, tcp_bufsz);

        let mut challenge = [0u8; CHALLENGE_SIZE];
        stream
            .read_exact(&mut challenge)
            .await
            .context("reading auth challenge")?;
        let challenge = AuthChallenge::parse(&challenge)?;

        let response = AuthResponse::answer(Ident::Server, password, challenge.phrase());
        stream
            .write_all(&response.encode())
            .await
            .context("writing auth response")?;

        let mut status = [0u8; STATUS_SIZE];
        stream
            .read_exact(&mut status)
            .await
            .context("reading auth status")?;
        match AuthStatus::parse(&status)? {
            AuthStatus::Success => {}
            AuthStatus::Failure => bail!("asset service at {addr} rejected credentials"),
        }
        tracing::info!(%addr, "connection established to asset service");

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let closed = CancellationToken::new();
        let peer = Arc::new(addr.to_string());

        tokio::spawn(write_loop(
            write_half,
            rx,
            pending.clone(),
            closed.clone(),
            peer.clone(),
        ));
        tokio::spawn(read_loop(read_half, pending, closed.clone(), peer.clone()));

        Ok(AssetServiceClient { tx, closed, peer })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has torn down.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn get(&self, id: AssetId, use_remote_cache: bool) -> Result<Asset, FetchError> {
        let kind = if use_remote_cache {
            RequestType::Get
        } else {
            RequestType::GetDontCache
        };
        let outcome = self
            .submit(
                RequestHeader::new(kind, id, 0),
                None,
                Expectation::Asset { id },
            )
            .await?;
        match outcome {
            Outcome::Asset(asset) => Ok(asset),
            _ => Err(FetchError::Disconnected),
        }
    }

    pub async fn put(&self, asset: &Asset) -> Result<(), FetchError> {
        let header = RequestHeader::new(RequestType::Put, asset.id(), asset.len() as u32);
        self.submit(header, Some(asset.data().clone()), Expectation::PutAck)
            .await
            .map(|_| ())
    }

    /// The comma-separated id listing of the shard named by `prefix`.
    pub async fn stored_ids(&self, prefix: &str) -> Result<String, FetchError> {
        let id = AssetId::from_prefix(prefix).map_err(|_| FetchError::NotFound)?;
        let header = RequestHeader::new(RequestType::StoredAssetIdsGet, id, 0);
        match self.submit(header, None, Expectation::Text).await? {
            Outcome::Text(ids) => Ok(ids),
            _ => Err(FetchError::Disconnected),
        }
    }

    async fn submit(
        &self,
        header: RequestHeader,
        payload: Option<Bytes>,
        expect: Expectation,
    ) -> Result<Outcome, FetchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command {
                header: header.encode(),
                payload,
                pending: Pending { expect, reply },
            })
            .map_err(|_| FetchError::Disconnected)?;
        rx.await.map_err(|_| FetchError::Disconnected)?
    }
}

/// Fails every pending waiter after a teardown.
fn fail_pending(pending: &Mutex<VecDeque<Pending>>, peer: &str) {
    let drained: Vec<Pending> = pending.lock().expect("pending lock").drain(..).collect();
    for entry in drained {
        tracing::error!(peer, "canceling transfer request due to connection closure");
        let _ = entry.reply.send(Err(FetchError::Disconnected));
    }
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Command>,
    pending: Arc<Mutex<VecDeque<Pending>>>,
    closed: CancellationToken,
    peer: Arc<String>,
) {
    loop {
        let command = tokio::select! {
            _ = closed.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        pending
            .lock()
            .expect("pending lock")
            .push_back(command.pending);

        let result = async {
            stream.write_all(&command.header).await?;
            if let Some(payload) = &command.payload {
                stream.write_all(payload).await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(err) = result {
            tracing::error!(peer = %*peer, %err, "error while writing asset request");
            break;
        }
    }

    closed.cancel();
    fail_pending(&pending, &peer);
}

async fn read_loop(
    mut stream: OwnedReadHalf,
    pending: Arc<Mutex<VecDeque<Pending>>>,
    closed: CancellationToken,
    peer: Arc<String>,
) {
    loop {
        let mut header = [0u8; RESPONSE_HEADER_SIZE];
        let read = tokio::select! {
            _ = closed.cancelled() => break,
            read = stream.read_exact(&mut header) => read,
        };
        if let Err(err) = read {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                tracing::error!(peer = %*peer, %err, "error while reading asset response");
            }
            break;
        }

        let header = match ResponseHeader::parse(&header) {
            Ok(header) => header,
            Err(err) => {
                tracing::error!(peer = %*peer, %err, "invalid response header");
                break;
            }
        };

        let Some(entry) = pending.lock().expect("pending lock").pop_front() else {
            tracing::error!(peer = %*peer, "response received with no request outstanding");
            break;
        };

        match handle_response(&mut stream, header, entry).await {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(peer = %*peer, %err, "asset service protocol violation");
                break;
            }
        }
    }

    closed.cancel();
    fail_pending(&pending, &peer);
}

/// Completes one pending request from `header` and its payload. A returned
/// error means the stream can no longer be trusted and must close; per-asset
/// failures are delivered to the waiter and are not errors here.
async fn handle_response(
    stream: &mut OwnedReadHalf,
    header: ResponseHeader,
    entry: Pending,
) -> anyhow::Result<()> {
    match (&entry.expect, header.code) {
        (Expectation::Asset { id }, ResponseCode::Found) => {
            let data = read_payload(stream, header.data_len).await?;
            let asset = match Asset::from_bytes(data) {
                Ok(asset) => asset,
                Err(err) => {
                    let _ = entry.reply.send(Err(FetchError::Disconnected));
                    bail!("unparseable asset payload: {err}");
                }
            };
            if asset.id() != *id {
                let _ = entry.reply.send(Err(FetchError::Disconnected));
                bail!(
                    "asset data received does not match next waiting request: expected {id}, got {}",
                    asset.id()
                );
            }
            let _ = entry.reply.send(Ok(Outcome::Asset(asset)));
            Ok(())
        }
        (Expectation::Asset { id }, ResponseCode::NotFound) => {
            if header.asset_id().ok() != Some(*id) {
                let _ = entry.reply.send(Err(FetchError::Disconnected));
                bail!("not-found response for an asset that was not requested");
            }
            let _ = entry.reply.send(Err(FetchError::NotFound));
            Ok(())
        }
        (_, ResponseCode::Error) => {
            // A single asset error does not poison the connection, but its
            // payload has to be drained to keep the stream aligned.
            let message = read_payload(stream, header.data_len).await?;
            let _ = entry.reply.send(Err(FetchError::Remote(
                String::from_utf8_lossy(&message).into_owned(),
            )));
            Ok(())
        }
        (Expectation::PutAck, ResponseCode::Ok) => {
            let _ = entry.reply.send(Ok(Outcome::Ack));
            Ok(())
        }
        (Expectation::Text, ResponseCode::Ok) => {
            let text = read_payload(stream, header.data_len).await?;
            let _ = entry.reply.send(Ok(Outcome::Text(
                String::from_utf8_lossy(&text).into_owned(),
            )));
            Ok(())
        }
        (_, code) => {
            let _ = entry.reply.send(Err(FetchError::Disconnected));
            bail!("unexpected response code {code:?} for pending request");
        }
    }
}

async fn read_payload(stream: &mut OwnedReadHalf, len: u32) -> anyhow::Result<Bytes> {
    let mut data = vec![0u8; len as usize];
    stream
        .read_exact(&mut data)
        .await
        .context("reading response payload")?;
    Ok(Bytes::from(data))
}
