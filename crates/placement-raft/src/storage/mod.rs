//! Raft storage
//!
//! - [`PlacementRaftStorage`]: openraft v1 `RaftStorage` (log + state machine)
//! - [`DiskStore`]: optional RocksDB persistence for the storage
//! - [`PlacementTypeConfig`], [`PlacementNode`]: openraft type configuration

mod disk;
mod raft_store;
mod types;

pub use disk::DiskStore;
pub use raft_store::{PlacementLogReader, PlacementRaftStorage, PlacementSnapshotBuilder, StoredSnapshot};
pub use types::{PlacementNode, PlacementTypeConfig};
