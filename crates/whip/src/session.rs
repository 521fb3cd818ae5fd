//! Per-connection protocol state machine: the authentication handshake
//! followed by the request/response loop. One request is in flight per
//! connection at a time, and responses are written in request order.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use whip_proto::auth::{AuthChallenge, AuthResponse, AuthStatus, RESPONSE_SIZE};
use whip_proto::client::{
    RequestHeader, RequestType, ResponseCode, ResponseHeader, REQUEST_HEADER_SIZE,
};
use whip_proto::AssetId;
use whip_vfs::Asset;

use crate::remote::set_socket_buffers;
use crate::server::App;

/// Serves one client connection to completion. Returning an error tears the
/// connection down; a clean EOF between requests returns `Ok`.
pub async fn serve(
    app: Arc<App>,
    mut stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let is_mesh = match authenticate(&app, &mut stream).await? {
        Some(is_mesh) => is_mesh,
        None => return Ok(()), // auth failure already answered
    };
    tracing::info!(%addr, mesh = is_mesh, "client authentication successful");

    app.stats.client_connected();
    let result = request_loop(&app, &mut stream, is_mesh, &cancel).await;
    app.stats.client_disconnected();

    if let Err(err) = &result {
        tracing::info!(%addr, %err, "client connection closed");
    }
    result
}

/// Unauthenticated state: challenge out, 41-byte response in, status out.
/// `Some(is_mesh)` on success; `None` when credentials were rejected.
async fn authenticate(app: &App, stream: &mut TcpStream) -> anyhow::Result<Option<bool>> {
    let config = app.config.snapshot();

    let challenge = AuthChallenge::generate();
    stream
        .write_all(&challenge.encode())
        .await
        .context("writing auth challenge")?;

    let mut response = [0u8; RESPONSE_SIZE];
    stream
        .read_exact(&mut response)
        .await
        .context("reading auth response")?;
    let response = AuthResponse::parse(&response)?;

    if !response.verifies(&config.password, challenge.phrase()) {
        tracing::info!("invalid auth challenge response, disconnecting");
        stream.write_all(&AuthStatus::Failure.encode()).await?;
        return Ok(None);
    }

    set_socket_buffers(stream, config.tcp_bufsz);
    stream.write_all(&AuthStatus::Success.encode()).await?;
    Ok(Some(response.is_server()))
}

async fn request_loop(
    app: &Arc<App>,
    stream: &mut TcpStream,
    is_mesh: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut session = Session {
        app: app.clone(),
        stream,
        is_mesh,
    };

    loop {
        let mut header = [0u8; REQUEST_HEADER_SIZE];
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = session.stream.read_exact(&mut header) => read,
        };
        match read {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err).context("reading request header"),
        }

        let header = RequestHeader::parse(&header)?;
        session.app.stats.add_request();
        session.dispatch(header).await?;
    }
}

struct Session<'a> {
    app: Arc<App>,
    stream: &'a mut TcpStream,
    is_mesh: bool,
}

impl Session<'_> {
    async fn dispatch(&mut self, header: RequestHeader) -> anyhow::Result<()> {
        match header.kind {
            RequestType::Get => self.handle_get(header, true).await,
            RequestType::GetDontCache => self.handle_get(header, false).await,
            RequestType::Put => self.handle_put(header).await,
            RequestType::Purge => self.handle_purge(header).await,
            RequestType::Test => self.handle_test(header).await,
            RequestType::PurgeLocals => self.handle_purge_locals().await,
            RequestType::StatusGet => self.handle_status().await,
            RequestType::StoredAssetIdsGet => self.handle_stored_ids(header).await,
        }
    }

    /// Writes a response header plus optional payload, feeding the transfer
    /// stats for any payload sent.
    async fn respond(
        &mut self,
        code: ResponseCode,
        id: AssetId,
        payload: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let data_len = payload.map(|p| p.len()).unwrap_or(0);
        let header = ResponseHeader::new(code, id, data_len as u32);
        self.stream
            .write_all(&header.encode())
            .await
            .context("writing response header")?;

        if let Some(payload) = payload {
            self.stream
                .write_all(payload)
                .await
                .context("writing response payload")?;
            self.app.stats.add_transfer(payload.len());
            if self.is_mesh {
                self.app.stats.add_mesh_transfer(payload.len());
            }
        }
        Ok(())
    }

    async fn respond_error(&mut self, id: AssetId, message: &str) -> anyhow::Result<()> {
        self.respond(ResponseCode::Error, id, Some(message.as_bytes()))
            .await
    }

    /// Malformed ids on id-addressed requests are protocol errors that
    /// disconnect the session.
    fn require_id(&self, header: &RequestHeader) -> anyhow::Result<AssetId> {
        header
            .asset_id()
            .map_err(|_| anyhow!("invalid asset UUID: {}", header.uuid_lossy()))
    }

    async fn handle_get(&mut self, header: RequestHeader, cache_result: bool) -> anyhow::Result<()> {
        let id = self.require_id(&header)?;

        match self.app.store.get(&id, cache_result).await {
            Ok(asset) => {
                let data = asset.data().clone();
                self.respond(ResponseCode::Found, id, Some(&data)).await
            }
            Err(err) => {
                if err.is_critical() {
                    tracing::error!(%id, %err, "asset read failed");
                }
                if self.is_mesh {
                    // Mesh peers already consulted the rest of the fleet;
                    // answering from here would recurse.
                    return self.respond(ResponseCode::NotFound, id, None).await;
                }
                match self.app.mesh.fetch(id).await {
                    Some(asset) => {
                        let data = asset.data().clone();
                        self.respond(ResponseCode::Found, id, Some(&data)).await
                    }
                    None => self.respond(ResponseCode::NotFound, id, None).await,
                }
            }
        }
    }

    async fn handle_put(&mut self, header: RequestHeader) -> anyhow::Result<()> {
        let mut data = vec![0u8; header.data_len as usize];
        self.stream
            .read_exact(&mut data)
            .await
            .context("reading asset payload")?;
        self.app.stats.add_transfer(data.len());

        let id = self.require_id(&header)?;

        let asset = match Asset::from_bytes(Bytes::from(data)) {
            Ok(asset) => asset,
            Err(err) => return self.respond_error(id, &err.to_string()).await,
        };
        if asset.id() != id {
            return self
                .respond_error(id, "asset id does not match request header")
                .await;
        }

        match self.app.store.put(asset).await {
            Ok(()) => self.respond(ResponseCode::Ok, id, None).await,
            Err(err) => {
                if err.is_critical() {
                    tracing::error!(%id, %err, "asset write failed");
                }
                self.respond_error(id, &err.to_string()).await
            }
        }
    }

    async fn handle_purge(&mut self, header: RequestHeader) -> anyhow::Result<()> {
        let id = self.require_id(&header)?;
        match self.app.store.purge(&id).await {
            Ok(()) => self.respond(ResponseCode::Ok, id, None).await,
            Err(err) => self.respond_error(id, &err.to_string()).await,
        }
    }

    async fn handle_test(&mut self, header: RequestHeader) -> anyhow::Result<()> {
        let id = self.require_id(&header)?;
        let code = if self.app.store.exists(&id) {
            ResponseCode::Found
        } else {
            ResponseCode::NotFound
        };
        self.respond(code, id, None).await
    }

    async fn handle_purge_locals(&mut self) -> anyhow::Result<()> {
        self.app.store.begin_purge_locals();
        self.respond(ResponseCode::Ok, AssetId::NULL, None).await
    }

    async fn handle_status(&mut self) -> anyhow::Result<()> {
        let mut report = String::from("WHIP Server Status\n\n");
        report.push_str("-General\n");
        report.push_str(&format!(
            "  Clients Connected: {}\n",
            self.app.stats.clients()
        ));

        match self.app.store.status_report(&mut report).await {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(%err, "status collection failed");
                return self.respond_error(AssetId::NULL, &err.to_string()).await;
            }
        }
        self.app.mesh.status_report(&mut report);

        let report = Bytes::from(report);
        self.respond(ResponseCode::Ok, AssetId::NULL, Some(&report))
            .await
    }

    async fn handle_stored_ids(&mut self, header: RequestHeader) -> anyhow::Result<()> {
        // Only the leading shard prefix of the id field is meaningful.
        let id = self.require_id(&header)?;
        let prefix = id.shard_prefix().to_string();

        match self.app.store.stored_ids(&prefix).await {
            Ok(ids) => {
                let ids = Bytes::from(ids);
                self.respond(ResponseCode::Ok, AssetId::NULL, Some(&ids))
                    .await
            }
            Err(err) => {
                tracing::error!(prefix, %err, "stored-ids collection failed");
                self.respond_error(AssetId::NULL, &err.to_string()).await
            }
        }
    }
}
