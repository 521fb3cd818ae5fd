//! Server configuration: a flat `key = value` file, re-read from disk on
//! every intramesh heartbeat tick so peer lists and replication partners can
//! change without a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};

pub const DEFAULT_CLIENT_PORT: u16 = 32700;
pub const DEFAULT_INTRAMESH_PORT: u16 = 32701;

const DEFAULT_TCP_BUFSZ: usize = 65536;
const DEFAULT_CACHE_SIZE_MB: u64 = 1024;
const DEFAULT_PULL_FREQUENCY_MINUTES: u64 = 720;

/// One configured mesh peer: `host:queryPort:assetPort`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub host: String,
    pub query_port: u16,
    pub asset_port: u16,
}

impl PeerEntry {
    pub fn query_addr(&self) -> String {
        format!("{}:{}", self.host, self.query_port)
    }

    pub fn asset_addr(&self) -> String {
        format!("{}:{}", self.host, self.asset_port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub intramesh_port: u16,
    pub password: String,
    pub cache_enabled: bool,
    pub cache_size_mb: u64,
    pub disk_storage_root: PathBuf,
    pub allow_purge: bool,
    pub debug: bool,
    pub is_writable: bool,
    pub intramesh_peers: Vec<PeerEntry>,
    pub tcp_bufsz: usize,
    /// `host:port` of the master this node pulls from, if it is a slave.
    pub replication_master: Option<String>,
    /// `host:port` of the slave this node pushes to, if it is a master.
    pub replication_slave: Option<String>,
    /// Minutes between pull sweeps.
    pub pull_replication_frequency: u64,
    /// In-flight GETs per shard during a pull sweep.
    pub pull_replication_batch_size: usize,
    /// Shard prefix the first pull sweep resumes from.
    pub pull_replication_start_at: u32,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!("could not open configuration file '{}'", path.display())
        })?;
        Self::parse(&text)
            .with_context(|| format!("error in configuration file '{}'", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut values = HashMap::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected 'key = value', got '{line}'", number + 1);
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        let backend = values
            .get("disk_storage_backend")
            .context("disk_storage_backend must be specified")?;
        if backend != "vfs" {
            bail!("disk_storage_backend must be vfs");
        }
        let disk_storage_root: PathBuf = values
            .get("disk_storage_root")
            .filter(|root| !root.is_empty())
            .context("disk_storage_root must be specified")?
            .into();

        Ok(Config {
            port: parse_or(&values, "port", DEFAULT_CLIENT_PORT)?,
            intramesh_port: parse_or(&values, "intramesh_port", DEFAULT_INTRAMESH_PORT)?,
            password: values
                .get("password")
                .context("password must be specified")?
                .clone(),
            cache_enabled: parse_bool_or(&values, "cache_enabled", true)?,
            cache_size_mb: parse_or(&values, "cache_size", DEFAULT_CACHE_SIZE_MB)?,
            disk_storage_root,
            allow_purge: parse_bool_or(&values, "allow_purge", false)?,
            debug: parse_bool_or(&values, "debug", false)?,
            is_writable: parse_bool_or(&values, "is_writable", true)?,
            intramesh_peers: parse_peers(values.get("intramesh_peers").map(String::as_str)),
            tcp_bufsz: parse_or(&values, "tcp_bufsz", DEFAULT_TCP_BUFSZ)?,
            replication_master: optional(values.get("replication_master")),
            replication_slave: optional(values.get("replication_slave")),
            pull_replication_frequency: parse_or(
                &values,
                "pull_replication_frequency",
                DEFAULT_PULL_FREQUENCY_MINUTES,
            )?,
            pull_replication_batch_size: parse_or(&values, "pull_replication_batch_size", 1)?,
            pull_replication_start_at: parse_or(&values, "pull_replication_start_at", 0)?,
        })
    }

    /// The cache budget in bytes: the configured megabyte count times 1e6.
    pub fn cache_bytes(&self) -> u64 {
        self.cache_size_mb * 1_000_000
    }
}

fn parse_or<T: std::str::FromStr>(
    values: &HashMap<String, String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match values.get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value '{raw}' for {key}")),
        None => Ok(default),
    }
}

fn parse_bool_or(
    values: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    let Some(raw) = values.get(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid value '{raw}' for {key}, expected a boolean"),
    }
}

/// `none` and the empty string both mean "unset".
fn optional(value: Option<&String>) -> Option<String> {
    value
        .filter(|v| !v.is_empty() && v.as_str() != "none")
        .cloned()
}

/// Parses `host:queryPort:assetPort,host:queryPort:assetPort`. Entries that
/// do not split into exactly three fields are skipped; the literal `none`
/// disables the mesh.
fn parse_peers(value: Option<&str>) -> Vec<PeerEntry> {
    let Some(value) = value else {
        return Vec::new();
    };
    if value == "none" || value.is_empty() {
        return Vec::new();
    }

    let mut peers = Vec::new();
    for entry in value.split(',') {
        let fields: Vec<&str> = entry.trim().split(':').collect();
        if fields.len() != 3 {
            tracing::warn!(entry, "skipping malformed intramesh peer entry");
            continue;
        }
        match (fields[1].parse(), fields[2].parse()) {
            (Ok(query_port), Ok(asset_port)) => peers.push(PeerEntry {
                host: fields[0].to_string(),
                query_port,
                asset_port,
            }),
            _ => tracing::warn!(entry, "skipping intramesh peer entry with invalid port"),
        }
    }
    peers
}

/// The live configuration: a snapshot-on-read handle that the heartbeat tick
/// refreshes from disk. A failed reload keeps the previous snapshot.
pub struct ConfigHandle {
    current: RwLock<Arc<Config>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: Config, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(ConfigHandle {
            current: RwLock::new(Arc::new(config)),
            path,
        })
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().expect("config lock").clone()
    }

    pub fn reload(&self) {
        let Some(path) = &self.path else { return };
        match Config::load(path) {
            Ok(config) => {
                *self.current.write().expect("config lock") = Arc::new(config);
            }
            Err(err) => {
                tracing::warn!(%err, "configuration reload failed, keeping previous settings")
            }
        }
    }
}
