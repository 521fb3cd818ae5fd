//! Shared fixtures for the black-box protocol tests: an in-process server
//! on ephemeral ports and a minimal protocol client speaking raw bytes.
#![allow(dead_code)] // each test binary uses a different slice of this module

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use whip::{AssetServer, Config};
use whip_proto::auth::challenge_hash;

pub const PASSWORD: &str = "secret";

pub struct TestNode {
    pub root: tempfile::TempDir,
    pub client_addr: SocketAddr,
    pub mesh_addr: SocketAddr,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    pub async fn start() -> TestNode {
        Self::start_with("", "").await
    }

    /// Starts a node with ephemeral ports. `peers` is the raw
    /// `intramesh_peers` value; `extra` is appended verbatim to the
    /// configuration file.
    pub async fn start_with(peers: &str, extra: &str) -> TestNode {
        let root = tempfile::tempdir().expect("create storage root");
        let mut text = format!(
            "port = 0\n\
             intramesh_port = 0\n\
             password = {PASSWORD}\n\
             disk_storage_backend = vfs\n\
             disk_storage_root = {}\n",
            root.path().display()
        );
        if !peers.is_empty() {
            text.push_str(&format!("intramesh_peers = {peers}\n"));
        }
        text.push_str(extra);

        let config = Config::parse(&text).expect("parse test config");
        let cancel = CancellationToken::new();
        let server = AssetServer::bind(config, None, cancel.clone())
            .await
            .expect("bind test server");
        // The listeners bind the wildcard address; dial loopback.
        let client_addr = SocketAddr::from(([127, 0, 0, 1], server.client_addr().port()));
        let mesh_addr = SocketAddr::from(([127, 0, 0, 1], server.mesh_addr().port()));
        let task = tokio::spawn(server.serve());

        TestNode {
            root,
            client_addr,
            mesh_addr,
            cancel,
            task,
        }
    }

    pub fn shard_path(&self, prefix: &str) -> std::path::PathBuf {
        self.root.path().join(prefix)
    }

    /// Shuts the node down, returning the storage root so tests can restart
    /// a node over the same on-disk state.
    pub async fn stop(self) -> tempfile::TempDir {
        self.cancel.cancel();
        let _ = self.task.await;
        self.root
    }
}

/// Builds the wire form of an asset: id, type byte, locality byte, payload.
pub fn asset_bytes(id: &str, kind: u8, local: bool, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(34 + payload.len());
    buf.extend_from_slice(id.as_bytes());
    buf.push(kind);
    buf.push(local as u8);
    buf.extend_from_slice(payload);
    buf
}

pub struct Client {
    pub stream: TcpStream,
}

pub struct Response {
    pub code: u8,
    pub uuid: String,
    pub payload: Vec<u8>,
}

impl Client {
    /// Connects and completes the challenge/response handshake as a plain
    /// client (identifier 0), asserting the server accepts it.
    pub async fn connect(addr: SocketAddr) -> Client {
        let mut client = Self::connect_with(addr, PASSWORD, 0).await;
        let status = client.read_auth_status().await;
        assert_eq!(status, [1, 0], "expected auth success");
        client
    }

    /// Runs the handshake with an arbitrary password and identifier byte,
    /// leaving the auth status unread.
    pub async fn connect_with(addr: SocketAddr, password: &str, ident: u8) -> Client {
        let mut stream = TcpStream::connect(addr).await.expect("connect");

        let mut challenge = [0u8; 8];
        stream
            .read_exact(&mut challenge)
            .await
            .expect("read challenge");
        assert_eq!(challenge[0], 0, "challenge identifier byte");
        for ch in &challenge[1..] {
            assert!((b'0'..=b'z').contains(ch), "challenge phrase byte {ch}");
        }

        let mut response = Vec::with_capacity(41);
        response.push(ident);
        response.extend_from_slice(challenge_hash(password, &challenge[1..]).as_bytes());
        stream.write_all(&response).await.expect("write response");

        Client { stream }
    }

    pub async fn read_auth_status(&mut self) -> [u8; 2] {
        let mut status = [0u8; 2];
        self.stream
            .read_exact(&mut status)
            .await
            .expect("read auth status");
        status
    }

    pub async fn send_request(&mut self, kind: u8, uuid: &str, payload: &[u8]) {
        assert_eq!(uuid.len(), 32);
        let mut header = Vec::with_capacity(37 + payload.len());
        header.push(kind);
        header.extend_from_slice(uuid.as_bytes());
        header.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        header.extend_from_slice(payload);
        self.stream.write_all(&header).await.expect("write request");
    }

    pub async fn read_response(&mut self) -> Response {
        let mut header = [0u8; 37];
        self.stream
            .read_exact(&mut header)
            .await
            .expect("read response header");
        let data_len = u32::from_be_bytes(header[33..37].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; data_len];
        self.stream
            .read_exact(&mut payload)
            .await
            .expect("read response payload");
        Response {
            code: header[0],
            uuid: String::from_utf8_lossy(&header[1..33]).into_owned(),
            payload,
        }
    }

    pub async fn request(&mut self, kind: u8, uuid: &str, payload: &[u8]) -> Response {
        self.send_request(kind, uuid, payload).await;
        self.read_response().await
    }

    /// True once the server has dropped its end of the connection.
    pub async fn is_disconnected(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            tokio::time::timeout(std::time::Duration::from_secs(5), self.stream.read(&mut buf))
                .await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

/// Request type bytes.
pub const RT_GET: u8 = 10;
pub const RT_PUT: u8 = 11;
pub const RT_PURGE: u8 = 12;
pub const RT_TEST: u8 = 13;
pub const RT_PURGE_LOCALS: u8 = 14;
pub const RT_STATUS_GET: u8 = 15;
pub const RT_STORED_IDS_GET: u8 = 16;
pub const RT_GET_NOCACHE: u8 = 17;

/// Response code bytes.
pub const RC_FOUND: u8 = 10;
pub const RC_NOT_FOUND: u8 = 11;
pub const RC_ERROR: u8 = 12;
pub const RC_OK: u8 = 13;

pub const NULL_UUID: &str = "00000000000000000000000000000000";
