//! Raft Network Layer
//!
//! gRPC-based transport between placement nodes.
//!
//! - [`RaftNetwork`]: client side for one target node
//! - [`RaftNetworkFactory`]: creates clients and caches channels
//! - [`RaftService`]: server side handling incoming Raft RPCs

mod network;
mod service;

pub use network::{RaftNetwork, RaftNetworkFactory};
pub use service::raft_server::RaftServer;
pub use service::{RaftRpcRequest, RaftRpcResponse, RaftService};
