use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use whip_vfs::{Asset, StoreHook};

use crate::config::ConfigHandle;
use crate::remote::AssetServiceClient;

/// Hard bound on assets waiting to be pushed. Overflow is dropped silently;
/// the slave's pull sweep will pick up whatever falls through.
const MAX_QUEUE_SIZE: usize = 250;

/// Cadence of the connection monitor.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// The push half of replication: streams successful local stores to the
/// configured slave over one serialized asset-service connection.
pub struct PushReplication {
    queue: mpsc::Sender<Asset>,
}

impl PushReplication {
    pub fn start(config: Arc<ConfigHandle>, cancel: CancellationToken) -> Self {
        let (queue, rx) = mpsc::channel(MAX_QUEUE_SIZE);
        tokio::spawn(run(config, rx, cancel));
        PushReplication { queue }
    }

    /// The hook handed to the disk worker. Local assets never replicate;
    /// global ones are queued best-effort.
    pub fn store_hook(&self) -> StoreHook {
        let queue = self.queue.clone();
        Box::new(move |asset: Asset| {
            if asset.is_local() {
                return;
            }
            let _ = queue.try_send(asset);
        })
    }
}

async fn run(config: Arc<ConfigHandle>, mut rx: mpsc::Receiver<Asset>, cancel: CancellationToken) {
    let mut client: Option<AssetServiceClient> = None;
    let mut slave: Option<String> = None;
    let mut monitor = tokio::time::interval(MONITOR_INTERVAL);
    monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(client) = &client {
                    client.close();
                }
                return;
            }

            _ = monitor.tick() => {
                let configured = config.snapshot().replication_slave.clone();
                if configured != slave {
                    // Slave appeared, disappeared, or moved.
                    if let Some(client) = client.take() {
                        client.close();
                    }
                    slave = configured;
                    if slave.is_none() {
                        tracing::info!("push replication slave cleared");
                    }
                }

                if let Some(addr) = &slave {
                    let connected = client.as_ref().map(|c| !c.is_closed()).unwrap_or(false);
                    if !connected {
                        tracing::info!(slave = %addr, "connecting to push replication slave");
                        let cfg = config.snapshot();
                        match AssetServiceClient::connect(addr, &cfg.password, cfg.tcp_bufsz).await {
                            Ok(new_client) => {
                                tracing::info!(slave = %addr, "connected to push replication slave");
                                client = Some(new_client);
                            }
                            Err(err) => {
                                tracing::error!(slave = %addr, %err, "connection to push replication slave failed");
                                client = None;
                            }
                        }
                    }
                }
            }

            asset = rx.recv() => {
                let Some(asset) = asset else { return };
                // With no connected slave the asset is simply dropped.
                let Some(active) = client.as_ref().filter(|c| !c.is_closed()) else {
                    continue;
                };
                if let Err(err) = active.put(&asset).await {
                    tracing::error!(id = %asset.id(), %err, "push replication failed for asset");
                }
            }
        }
    }
}
