use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use whip_proto::AssetId;
use whip_vfs::{StorageError, VfsHandle};

use crate::config::ConfigHandle;
use crate::remote::{AssetServiceClient, FetchError};

/// Delay before retrying a failed or dropped master connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// How often the idle/wait states re-examine configuration and clocks.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Highest shard prefix, inclusive.
const LAST_PREFIX: u32 = 0xfff;

/// The pull half of replication. Runs only while `replication_master` is
/// configured; a sweep survives reconnects and resumes at the shard prefix
/// it was interrupted in.
pub struct PullReplication;

enum SweepOutcome {
    Completed,
    Reconnect,
    MasterChanged,
    Stopped,
}

impl PullReplication {
    pub fn spawn(
        config: Arc<ConfigHandle>,
        vfs: VfsHandle,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run(config, vfs, cancel))
    }
}

async fn run(config: Arc<ConfigHandle>, vfs: VfsHandle, cancel: CancellationToken) {
    // The very first sweep may resume part-way through the id space.
    let mut next_prefix = config
        .snapshot()
        .pull_replication_start_at
        .min(LAST_PREFIX);
    let mut next_sweep_at: Option<Instant> = None;
    let mut announced_idle = false;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let cfg = config.snapshot();
        let Some(master) = cfg.replication_master.clone() else {
            if !announced_idle {
                tracing::info!("no master server set, pull replication disabled");
                announced_idle = true;
            }
            if sleep(POLL_INTERVAL, &cancel).await {
                return;
            }
            continue;
        };
        announced_idle = false;

        if let Some(at) = next_sweep_at {
            if Instant::now() < at {
                if sleep(POLL_INTERVAL, &cancel).await {
                    return;
                }
                continue;
            }
            next_sweep_at = None;
            next_prefix = 0;
        }

        tracing::info!(%master, "attempting connection to replication master");
        let client = match AssetServiceClient::connect(&master, &cfg.password, cfg.tcp_bufsz).await
        {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(%master, %err, "master server connection failed");
                if sleep(RECONNECT_DELAY, &cancel).await {
                    return;
                }
                continue;
            }
        };

        match sweep(&config, &vfs, &client, &master, &mut next_prefix, &cancel).await {
            SweepOutcome::Stopped => {
                client.close();
                return;
            }
            SweepOutcome::MasterChanged => {
                tracing::info!("replication master has changed, reconnecting to new master");
                client.close();
            }
            SweepOutcome::Reconnect => {
                client.close();
                if sleep(RECONNECT_DELAY, &cancel).await {
                    return;
                }
            }
            SweepOutcome::Completed => {
                client.close();
                let wait = Duration::from_secs(cfg.pull_replication_frequency * 60);
                next_sweep_at = Some(Instant::now() + wait);
                next_prefix = 0;
                tracing::info!(
                    %master,
                    next_run_minutes = cfg.pull_replication_frequency,
                    "pull replication run completed"
                );
            }
        }
    }
}

/// Walks shard prefixes from `*next_prefix` through `fff`, leaving
/// `*next_prefix` at the first unfinished shard so the caller can resume.
async fn sweep(
    config: &ConfigHandle,
    vfs: &VfsHandle,
    client: &AssetServiceClient,
    master: &str,
    next_prefix: &mut u32,
    cancel: &CancellationToken,
) -> SweepOutcome {
    while *next_prefix <= LAST_PREFIX {
        if cancel.is_cancelled() {
            return SweepOutcome::Stopped;
        }
        // Configuration reloads on the heartbeat tick; a new master aborts
        // the sweep in progress.
        if config.snapshot().replication_master.as_deref() != Some(master) {
            return SweepOutcome::MasterChanged;
        }

        let prefix = format!("{:03x}", *next_prefix);
        let listing = match client.stored_ids(&prefix).await {
            Ok(listing) => listing,
            Err(FetchError::Disconnected) => return SweepOutcome::Reconnect,
            Err(err) => {
                tracing::error!(prefix, %err, "error requesting asset list from master");
                *next_prefix += 1;
                continue;
            }
        };

        let missing: Vec<AssetId> = listing
            .split(',')
            .filter(|id| !id.is_empty())
            .filter_map(|id| id.parse::<AssetId>().ok())
            .filter(|id| !vfs.exists(id))
            .collect();

        if !missing.is_empty() {
            tracing::info!(count = missing.len(), prefix, "requesting assets for pull");
        }

        let batch_size = config.snapshot().pull_replication_batch_size.max(1);
        for batch in missing.chunks(batch_size) {
            if cancel.is_cancelled() {
                return SweepOutcome::Stopped;
            }

            // Another writer (a client PUT, push replication) may have
            // landed the asset since the listing was taken.
            let wanted: Vec<AssetId> = batch.iter().filter(|id| !vfs.exists(id)).copied().collect();
            let fetches = wanted.iter().map(|id| client.get(*id, false));
            let results = futures::future::join_all(fetches).await;

            for (id, result) in wanted.iter().zip(results) {
                match result {
                    Ok(asset) => {
                        match vfs.put(asset).await {
                            Ok(()) | Err(StorageError::AlreadyExists(_)) => {}
                            Err(err) => {
                                tracing::error!(%id, %master, %err, "unable to save asset from replication server");
                            }
                        }
                    }
                    Err(FetchError::Disconnected) => return SweepOutcome::Reconnect,
                    Err(err) => {
                        tracing::error!(%id, %master, %err, "unable to retrieve asset from replication server");
                    }
                }
            }
        }

        *next_prefix += 1;
    }

    SweepOutcome::Completed
}

/// Sleeps for `duration`; true means the token fired and the caller should
/// stop.
async fn sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
