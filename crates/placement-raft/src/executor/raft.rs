//! RaftExecutor - cluster mode executor using Raft consensus

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::commands::{ApplyResponse, Command};
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::node::RaftNode;
use crate::state_machine::PlacementFsm;

/// Routes commands through the local Raft node and waits for commit.
#[derive(Debug)]
pub struct RaftExecutor {
    node: Arc<RaftNode>,
    timeout: Duration,
}

impl RaftExecutor {
    pub fn new(node: Arc<RaftNode>, timeout: Duration) -> Self {
        Self { node, timeout }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }
}

#[async_trait]
impl CommandExecutor for RaftExecutor {
    async fn execute(&self, command: Command) -> Result<ApplyResponse> {
        self.node.apply_command(&command, self.timeout).await
    }

    fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    fn leader_hint(&self) -> Option<String> {
        self.node.current_leader_name()
    }

    fn leadership_changes(&self) -> watch::Receiver<bool> {
        self.node.leadership_changes()
    }

    fn fsm(&self) -> Arc<PlacementFsm> {
        self.node.fsm().clone()
    }

    async fn shutdown(&self) -> Result<()> {
        self.node.shutdown().await
    }
}
