//! DirectExecutor - in-process execution without consensus
//!
//! Applies commands straight to a local [`PlacementFsm`] with a
//! monotonically increasing index. Leadership is a switch the owner flips,
//! which is how tests drive leadership transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::commands::{ApplyResponse, Command};
use crate::error::{RaftError, Result};
use crate::executor::CommandExecutor;
use crate::state_machine::PlacementFsm;

#[derive(Debug)]
pub struct DirectExecutor {
    fsm: Arc<PlacementFsm>,
    next_index: AtomicU64,
    apply_lock: Mutex<()>,
    leader_tx: watch::Sender<bool>,
}

impl DirectExecutor {
    /// Create an executor that starts as leader
    pub fn new(fsm: Arc<PlacementFsm>) -> Self {
        let (leader_tx, _) = watch::channel(true);
        Self {
            next_index: AtomicU64::new(fsm.index() + 1),
            fsm,
            apply_lock: Mutex::new(()),
            leader_tx,
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader_tx.send_if_modified(|current| {
            let changed = *current != leader;
            *current = leader;
            changed
        });
    }
}

#[async_trait]
impl CommandExecutor for DirectExecutor {
    async fn execute(&self, command: Command) -> Result<ApplyResponse> {
        if !self.is_leader() {
            return Err(RaftError::not_leader(None));
        }
        let data = command.encode()?;

        let _guard = self.apply_lock.lock();
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        Ok(self.fsm.apply(index, &data))
    }

    fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    fn leader_hint(&self) -> Option<String> {
        self.is_leader().then(|| "local".to_string())
    }

    fn leadership_changes(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    fn fsm(&self) -> Arc<PlacementFsm> {
        self.fsm.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        self.set_leader(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Member;

    #[tokio::test]
    async fn test_direct_executor_applies_in_order() {
        let fsm = Arc::new(PlacementFsm::new(10));
        let executor = DirectExecutor::new(fsm.clone());

        let resp = executor
            .execute(Command::Upsert(Member::new("127.0.0.1:3000", "app", vec!["cart".into()])))
            .await
            .unwrap();
        assert!(resp.updated);
        assert_eq!(fsm.member_count(), 1);
        assert_eq!(fsm.index(), 1);

        executor.execute(Command::Remove("127.0.0.1:3000".into())).await.unwrap();
        assert_eq!(fsm.member_count(), 0);
        assert_eq!(fsm.index(), 2);
    }

    #[tokio::test]
    async fn test_follower_rejects_commands() {
        let executor = DirectExecutor::new(Arc::new(PlacementFsm::new(10)));
        let mut changes = executor.leadership_changes();

        executor.set_leader(false);
        assert!(changes.has_changed().unwrap());
        assert!(!*changes.borrow_and_update());

        let err = executor.execute(Command::Disseminate).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }
}
