//! OpenRaft Type Configuration

use std::io::Cursor;

use openraft::{Entry, RaftTypeConfig};
use serde::{Deserialize, Serialize};

use crate::commands::ApplyResponse;

/// Type configuration for the placement Raft group
///
/// - `D`: encoded [`crate::Command`] bytes (tag + MessagePack member)
/// - `R`: [`ApplyResponse`]
/// - `NodeId`: FNV-1a of the string node id
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PlacementTypeConfig;

impl RaftTypeConfig for PlacementTypeConfig {
    type D = Vec<u8>;
    type R = ApplyResponse;
    type NodeId = u64;
    type Node = PlacementNode;
    type Entry = Entry<Self>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<Self>;
}

/// Node information for cluster membership
///
/// **Important**: Do NOT use `skip_serializing_if` on any fields!
/// Bincode is a non-self-describing format that requires all fields to be present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlacementNode {
    /// String node id from `--initial-cluster`
    pub name: String,
    /// Raft transport address (e.g., "127.0.0.1:8201")
    pub rpc_addr: String,
}

impl PlacementNode {
    pub fn new(name: impl Into<String>, rpc_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc_addr: rpc_addr.into(),
        }
    }
}

impl std::fmt::Display for PlacementNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.rpc_addr)
    }
}

impl std::error::Error for PlacementNode {}
