//! Raft consensus layer for the placement service
//!
//! Host membership is the only replicated domain data. Every node applies
//! the same [`Command`] stream to its [`PlacementFsm`], which keeps one
//! consistent hash ring per actor type derived from the member map.
//!
//! ## Key Components
//!
//! - [`Command`]: tagged membership command (upsert / remove / disseminate)
//! - [`PlacementFsm`]: member map, table generation and derived rings
//! - [`PlacementRaftStorage`]: openraft v1 storage, in-memory or RocksDB-backed
//! - [`RaftNode`]: openraft instance + gRPC transport + leadership watch
//! - [`CommandExecutor`]: uniform submit path ([`RaftExecutor`] in a cluster,
//!   [`DirectExecutor`] for a single in-process state machine)
//!
//! ```rust,ignore
//! let fsm = Arc::new(PlacementFsm::new(100));
//! let node = RaftNode::start(config, fsm.clone()).await?;
//! let executor = RaftExecutor::new(node, Duration::from_secs(5));
//! executor.execute(Command::Upsert(member)).await?;
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod network;
pub mod node;
pub mod state_machine;
pub mod storage;

pub use commands::{ApplyResponse, Command, CommandTag, Member};
pub use config::{node_id_for, parse_peers, PeerConfig, RaftNodeConfig};
pub use error::{RaftError, Result};
pub use executor::{CommandExecutor, DirectExecutor, RaftExecutor};
pub use network::{RaftNetwork, RaftNetworkFactory, RaftService};
pub use node::RaftNode;
pub use state_machine::{decode, encode, MemberState, PlacementFsm};
pub use storage::{PlacementNode, PlacementRaftStorage, PlacementTypeConfig};
