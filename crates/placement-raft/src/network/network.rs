//! Raft Network Implementation
//!
//! Provides the network transport for Raft RPCs using gRPC (tonic).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{
    RPCOption, RaftNetwork as OpenRaftNetwork, RaftNetworkFactory as OpenRaftNetworkFactory,
};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tonic::transport::{Channel, Endpoint};

use crate::network::service::{
    raft_client::RaftClient, RaftRpcRequest, RPC_APPEND_ENTRIES, RPC_INSTALL_SNAPSHOT, RPC_VOTE,
};
use crate::state_machine::{decode, encode};
use crate::storage::{PlacementNode, PlacementTypeConfig};

/// Simple connection error wrapper for openraft compatibility
#[derive(Debug)]
struct ConnectionError(String);

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConnectionError {}

/// Network client for one target node
pub struct RaftNetwork {
    target: u64,
    channel: Result<Channel, String>,
}

impl RaftNetwork {
    pub fn new(target: u64, channel: Result<Channel, String>) -> Self {
        Self { target, channel }
    }

    /// Send one RPC and decode the remote `Result`
    async fn send<Req, Resp, E>(
        &mut self,
        rpc_type: &str,
        rpc: &Req,
    ) -> Result<Resp, RPCError<u64, PlacementNode, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let channel = self
            .channel
            .clone()
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&ConnectionError(e))))?;

        let payload = encode(rpc).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let mut client = RaftClient::new(channel);
        let response = client
            .raft_rpc(tonic::Request::new(RaftRpcRequest {
                rpc_type: rpc_type.to_string(),
                payload,
            }))
            .await
            .map_err(|status| match status.code() {
                tonic::Code::Unavailable => RPCError::Unreachable(Unreachable::new(&status)),
                _ => RPCError::Network(NetworkError::new(&status)),
            })?;

        let inner = response.into_inner();
        if !inner.error.is_empty() {
            return Err(RPCError::Network(NetworkError::new(&ConnectionError(
                inner.error,
            ))));
        }

        let result: Result<Resp, E> =
            decode(&inner.payload).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl OpenRaftNetwork<PlacementTypeConfig> for RaftNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<PlacementTypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, PlacementNode, RaftError<u64>>> {
        self.send(RPC_APPEND_ENTRIES, &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<PlacementTypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, PlacementNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.send(RPC_INSTALL_SNAPSHOT, &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, PlacementNode, RaftError<u64>>> {
        self.send(RPC_VOTE, &rpc).await
    }
}

/// Factory for creating network instances
#[derive(Clone, Default)]
pub struct RaftNetworkFactory {
    /// Known nodes in the cluster
    nodes: Arc<RwLock<HashMap<u64, PlacementNode>>>,
    /// Cached gRPC channels (node_id -> channel)
    channels: Arc<dashmap::DashMap<u64, Channel>>,
}

impl RaftNetworkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node in the cluster
    pub fn register_node(&self, node_id: u64, node: PlacementNode) {
        self.nodes.write().insert(node_id, node);
    }

    /// Get node info by node ID
    pub fn get_node(&self, node_id: u64) -> Option<PlacementNode> {
        self.nodes.read().get(&node_id).cloned()
    }

    fn channel_for(&self, target: u64, node: &PlacementNode) -> Result<Channel, String> {
        if let Some(ch) = self.channels.get(&target) {
            return Ok(ch.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", node.rpc_addr))
            .map_err(|e| format!("invalid raft address {}: {}", node.rpc_addr, e))?
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10));

        // Connects lazily so an unreachable peer never blocks the factory
        let ch = endpoint.connect_lazy();
        self.channels.insert(target, ch.clone());
        Ok(ch)
    }
}

impl OpenRaftNetworkFactory<PlacementTypeConfig> for RaftNetworkFactory {
    type Network = RaftNetwork;

    async fn new_client(&mut self, target: u64, node: &PlacementNode) -> Self::Network {
        self.register_node(target, node.clone());
        let channel = self.channel_for(target, node);
        if let Err(e) = &channel {
            log::error!("Cannot create channel to node {} ({}): {}", target, node, e);
        }
        RaftNetwork::new(target, channel)
    }
}
