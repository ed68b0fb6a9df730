//! Raft node configuration
//!
//! `RaftNodeConfig` is the runtime config consumed by [`crate::RaftNode`];
//! the binary builds it from CLI flags and the optional TOML file.

use std::path::PathBuf;

use placement_commons::{fnv1a_64, DEFAULT_REPLICATION_FACTOR};

use crate::error::{RaftError, Result};

/// A Raft peer: string id and Raft transport address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

impl PeerConfig {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    /// Numeric openraft node id
    pub fn node_id(&self) -> u64 {
        node_id_for(&self.id)
    }
}

/// Numeric openraft node id for a string node id
pub fn node_id_for(id: &str) -> u64 {
    fnv1a_64(id)
}

/// Parse `id=host:port,id2=host:port` into peers
pub fn parse_peers(list: &str) -> Result<Vec<PeerConfig>> {
    let mut peers = Vec::new();
    for pair in list.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (id, address) = pair
            .split_once('=')
            .ok_or_else(|| RaftError::Config(format!("invalid peer '{}': expected id=address", pair)))?;
        let (id, address) = (id.trim(), address.trim());
        if id.is_empty() || address.is_empty() {
            return Err(RaftError::Config(format!("invalid peer '{}'", pair)));
        }
        if peers.iter().any(|p: &PeerConfig| p.id == id) {
            return Err(RaftError::Config(format!("duplicate peer id '{}'", id)));
        }
        peers.push(PeerConfig::new(id, address));
    }
    Ok(peers)
}

/// Runtime configuration for a placement Raft node
#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    /// This node's string id (must appear in `peers`)
    pub id: String,

    /// Every voter of the cluster, including this node
    pub peers: Vec<PeerConfig>,

    /// On-disk log/snapshot directory; `None` keeps everything in memory
    pub log_store_path: Option<PathBuf>,

    /// Raft heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Raft election timeout range (min, max) in milliseconds
    pub election_timeout_ms: (u64, u64),

    /// Build a snapshot after this many applied entries
    pub snapshot_logs_since_last: u64,

    /// Virtual nodes per host per actor type
    pub replication_factor: usize,
}

impl Default for RaftNodeConfig {
    fn default() -> Self {
        Self {
            id: "app-placement-0".to_string(),
            peers: vec![PeerConfig::new("app-placement-0", "127.0.0.1:8201")],
            log_store_path: None,
            heartbeat_interval_ms: 100,
            election_timeout_ms: (300, 600),
            snapshot_logs_since_last: 5000,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

impl RaftNodeConfig {
    pub fn node_id(&self) -> u64 {
        node_id_for(&self.id)
    }

    /// Address this node serves Raft RPCs on
    pub fn self_address(&self) -> Result<&str> {
        self.peers
            .iter()
            .find(|p| p.id == self.id)
            .map(|p| p.address.as_str())
            .ok_or_else(|| {
                RaftError::Config(format!("node id '{}' is not in the peer list", self.id))
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RaftError::Config("node id cannot be empty".to_string()));
        }
        self.self_address()?;
        let (min, max) = self.election_timeout_ms;
        if min == 0 || max <= min {
            return Err(RaftError::Config(format!(
                "invalid election timeout range ({}, {})",
                min, max
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= min {
            return Err(RaftError::Config(
                "heartbeat interval must be non-zero and below the election timeout".to_string(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(RaftError::Config("replication factor must be > 0".to_string()));
        }
        Ok(())
    }
}
