//! CommandExecutor trait and implementations
//!
//! The placement service submits every membership change through a
//! [`CommandExecutor`], so it never talks to openraft directly.
//!
//! ```text
//! CLUSTER:    PlacementService → RaftExecutor → RaftNode → PlacementFsm
//! IN-PROCESS: PlacementService → DirectExecutor → PlacementFsm
//! ```

mod direct;
mod raft;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::commands::{ApplyResponse, Command};
use crate::error::Result;
use crate::state_machine::PlacementFsm;

pub use direct::DirectExecutor;
pub use raft::RaftExecutor;

/// Submit path for membership commands
#[async_trait]
pub trait CommandExecutor: Send + Sync + std::fmt::Debug {
    /// Propose a command and wait until it is applied locally
    async fn execute(&self, command: Command) -> Result<ApplyResponse>;

    fn is_leader(&self) -> bool;

    /// Leader id as a display string, if known
    fn leader_hint(&self) -> Option<String>;

    /// Watch channel that flips on every leadership transition
    fn leadership_changes(&self) -> watch::Receiver<bool>;

    /// The local replica of the membership state machine
    fn fsm(&self) -> Arc<PlacementFsm>;

    async fn shutdown(&self) -> Result<()>;
}
