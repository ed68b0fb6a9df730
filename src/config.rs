// Configuration module
//
// Flags mirror the placement CLI. An optional TOML file supplies defaults
// for every section; explicit flags win over file values.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use placement_commons::DEFAULT_REPLICATION_FACTOR;
use placement_raft::{parse_peers, PeerConfig, RaftNodeConfig};
use placement_service::{PlacementServiceConfig, MIN_DISSEMINATION_INTERVAL};

/// Command-line flags
#[derive(Debug, Default, Parser)]
#[command(name = "placement", version, about = "Actor placement service")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Raft node id
    #[arg(long)]
    pub id: Option<String>,

    /// Bootstrap peers: id=host:port,id=host:port
    #[arg(long = "initial-cluster")]
    pub initial_cluster: Option<String>,

    #[arg(long = "inmem-store-enabled", num_args = 0..=1, default_missing_value = "true")]
    pub inmem_store_enabled: Option<bool>,

    /// On-disk Raft log directory; overrides the in-memory store
    #[arg(long = "raft-logstore-path")]
    pub raft_logstore_path: Option<String>,

    /// Host-facing gRPC port
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long = "healthz-port")]
    pub healthz_port: Option<u16>,

    /// Directory holding ca.crt, issuer.crt and issuer.key
    #[arg(long)]
    pub certchain: Option<PathBuf>,

    #[arg(long = "tls-enabled", num_args = 0..=1, default_missing_value = "true")]
    pub tls_enabled: Option<bool>,

    /// Virtual nodes per host per actor type
    #[arg(long = "replicationFactor")]
    pub replication_factor: Option<usize>,

    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// compact or json
    #[arg(long = "log-format")]
    pub log_format: Option<String>,
}

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub raft: RaftSettings,
    pub placement: PlacementSettings,
    pub logging: LoggingSettings,
}

/// Raft settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    pub id: String,
    pub initial_cluster: String,
    pub inmem_store_enabled: bool,
    pub raft_logstore_path: String,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub snapshot_logs_since_last: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            id: "app-placement-0".to_string(),
            initial_cluster: "app-placement-0=127.0.0.1:8201".to_string(),
            inmem_store_enabled: true,
            raft_logstore_path: String::new(),
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            snapshot_logs_since_last: 5000,
        }
    }
}

/// Host-facing server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementSettings {
    pub port: u16,
    pub healthz_port: u16,
    pub certchain: PathBuf,
    pub tls_enabled: bool,
    pub replication_factor: usize,
    pub heartbeat_interval_ms: u64,
    pub dissemination_interval_ms: u64,
    pub drain_grace_ms: u64,
    pub faulty_host_timeout_ms: u64,
    pub membership_batch_window_ms: u64,
    pub membership_channel_capacity: usize,
    pub proposal_timeout_ms: u64,
    pub graceful_timeout_secs: u64,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            port: 50005,
            healthz_port: 8080,
            certchain: PathBuf::from("/var/run/placement/credentials"),
            tls_enabled: false,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            heartbeat_interval_ms: 1000,
            dissemination_interval_ms: 2000,
            drain_grace_ms: 200,
            faulty_host_timeout_ms: 5000,
            membership_batch_window_ms: 2,
            membership_channel_capacity: 100,
            proposal_timeout_ms: 5000,
            graceful_timeout_secs: 10,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// compact | json
    pub format: String,
    pub log_to_console: bool,
    /// Also append to this file when set
    pub file_path: Option<String>,
    /// Per-target level overrides, e.g. `placement_raft = "debug"`
    pub targets: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            log_to_console: true,
            file_path: None,
            targets: HashMap::new(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const LOG_FORMATS: &[&str] = &["compact", "json"];

impl ServerConfig {
    /// Parse a TOML file and validate it
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.finalize()
    }

    /// File (if any) then flags, then validation
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.finalize()
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(id) = &cli.id {
            self.raft.id = id.clone();
        }
        if let Some(peers) = &cli.initial_cluster {
            self.raft.initial_cluster = peers.clone();
        }
        if let Some(inmem) = cli.inmem_store_enabled {
            self.raft.inmem_store_enabled = inmem;
        }
        if let Some(path) = &cli.raft_logstore_path {
            self.raft.raft_logstore_path = path.clone();
        }
        if let Some(port) = cli.port {
            self.placement.port = port;
        }
        if let Some(port) = cli.healthz_port {
            self.placement.healthz_port = port;
        }
        if let Some(dir) = &cli.certchain {
            self.placement.certchain = dir.clone();
        }
        if let Some(tls) = cli.tls_enabled {
            self.placement.tls_enabled = tls;
        }
        if let Some(factor) = cli.replication_factor {
            self.placement.replication_factor = factor;
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if let Some(format) = &cli.log_format {
            self.logging.format = format.clone();
        }
    }

    /// Normalize and validate
    pub fn finalize(mut self) -> Result<Self> {
        self.raft.id = self.raft.id.trim().to_string();
        self.logging.level = self.logging.level.to_lowercase();
        self.logging.format = self.logging.format.to_lowercase();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.raft.id.is_empty() {
            bail!("raft.id cannot be empty");
        }
        let peers = self.peers()?;
        if !peers.iter().any(|p| p.id == self.raft.id) {
            bail!(
                "node id '{}' is not part of the initial cluster '{}'",
                self.raft.id,
                self.raft.initial_cluster
            );
        }
        if !self.raft.inmem_store_enabled && self.log_store_path().is_none() {
            bail!("raft.raft_logstore_path is required when the in-memory store is disabled");
        }
        if self.placement.port == 0 {
            bail!("placement.port must be non-zero");
        }
        if self.placement.port == self.placement.healthz_port {
            bail!(
                "placement.port and placement.healthz_port must differ (both {})",
                self.placement.port
            );
        }
        if self.placement.replication_factor == 0 {
            bail!("placement.replication_factor must be > 0");
        }
        if self.dissemination_interval() < MIN_DISSEMINATION_INTERVAL {
            bail!(
                "placement.dissemination_interval_ms must be at least {}",
                MIN_DISSEMINATION_INTERVAL.as_millis()
            );
        }
        if self.placement.graceful_timeout_secs == 0 {
            bail!("placement.graceful_timeout_secs must be > 0");
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "invalid log level '{}', expected one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            );
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            bail!(
                "invalid log format '{}', expected one of {}",
                self.logging.format,
                LOG_FORMATS.join(", ")
            );
        }
        Ok(())
    }

    pub fn peers(&self) -> Result<Vec<PeerConfig>> {
        let peers = parse_peers(&self.raft.initial_cluster)
            .map_err(|e| anyhow!("invalid initial cluster: {}", e))?;
        if peers.is_empty() {
            bail!("initial cluster cannot be empty");
        }
        Ok(peers)
    }

    /// On-disk store when a path is set, in-memory otherwise
    pub fn log_store_path(&self) -> Option<PathBuf> {
        let path = self.raft.raft_logstore_path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }

    pub fn dissemination_interval(&self) -> Duration {
        Duration::from_millis(self.placement.dissemination_interval_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.placement.proposal_timeout_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.placement.graceful_timeout_secs)
    }

    pub fn raft_node_config(&self) -> Result<RaftNodeConfig> {
        Ok(RaftNodeConfig {
            id: self.raft.id.clone(),
            peers: self.peers()?,
            log_store_path: self.log_store_path(),
            heartbeat_interval_ms: self.raft.heartbeat_interval_ms,
            election_timeout_ms: (
                self.raft.election_timeout_min_ms,
                self.raft.election_timeout_max_ms,
            ),
            snapshot_logs_since_last: self.raft.snapshot_logs_since_last,
            replication_factor: self.placement.replication_factor,
        })
    }

    pub fn service_config(&self) -> PlacementServiceConfig {
        let p = &self.placement;
        PlacementServiceConfig {
            heartbeat_interval: Duration::from_millis(p.heartbeat_interval_ms),
            dissemination_interval: self.dissemination_interval(),
            drain_grace: Duration::from_millis(p.drain_grace_ms),
            faulty_host_timeout: Duration::from_millis(p.faulty_host_timeout_ms),
            membership_batch_window: Duration::from_millis(p.membership_batch_window_ms),
            membership_channel_capacity: p.membership_channel_capacity,
        }
    }
}
