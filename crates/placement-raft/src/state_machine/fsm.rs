//! Thread-safe placement FSM applied by the Raft storage

use parking_lot::RwLock;
use placement_commons::hashing::Consistent;
use placement_commons::proto;

use crate::commands::{ApplyResponse, Command, Member};
use crate::error::Result;
use crate::state_machine::MemberState;

/// Membership FSM.
///
/// Apply is serialized by the Raft log; the lock only guards readers
/// (dissemination, health, snapshots) against a concurrent apply.
#[derive(Debug)]
pub struct PlacementFsm {
    state: RwLock<MemberState>,
    replication_factor: usize,
}

impl PlacementFsm {
    pub fn new(replication_factor: usize) -> Self {
        Self {
            state: RwLock::new(MemberState::new(replication_factor)),
            replication_factor,
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Apply one encoded command at Raft `index`.
    ///
    /// Entries older than the last applied index are skipped. Undecodable
    /// entries are logged and treated as no-ops; the index still advances.
    pub fn apply(&self, index: u64, data: &[u8]) -> ApplyResponse {
        let mut state = self.state.write();
        if index < state.index {
            log::warn!(
                "Skipping stale placement entry: index {} < applied {}",
                index,
                state.index
            );
            return ApplyResponse::default();
        }
        state.index = index;

        let command = match Command::decode(data) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::error!("Failed to decode placement command at index {}: {}", index, e);
                return ApplyResponse::default();
            }
        };

        let updated = match &command {
            Command::Upsert(member) => state.upsert_member(member),
            Command::Remove(name) => state.remove_member(name),
            Command::Disseminate => false,
        };

        if updated {
            log::debug!(
                "Applied {:?} at index {}: table generation {}",
                command.tag(),
                index,
                state.table_generation
            );
        }
        ApplyResponse { updated }
    }

    /// Copy of the persisted state, taken under a short read lock
    pub fn snapshot(&self) -> MemberState {
        self.state.read().clone_members()
    }

    /// MessagePack snapshot bytes
    pub fn persist(&self) -> Result<Vec<u8>> {
        self.snapshot().persist()
    }

    /// Replace the state with a decoded snapshot and rebuild the rings
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let restored = MemberState::restore(bytes, self.replication_factor)?;
        log::info!(
            "Restored placement state: {} members, generation {}, index {}",
            restored.members.len(),
            restored.table_generation,
            restored.index
        );
        *self.state.write() = restored;
        Ok(())
    }

    /// Reset to an empty state (used when an empty snapshot is installed)
    pub fn reset(&self) {
        *self.state.write() = MemberState::new(self.replication_factor);
    }

    pub fn placement_tables(&self) -> proto::PlacementTables {
        self.state.read().placement_tables()
    }

    pub fn table_generation(&self) -> u64 {
        self.state.read().table_generation
    }

    pub fn index(&self) -> u64 {
        self.state.read().index
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        self.state.read().members.get(name).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        self.state.read().members.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn ring(&self, actor_type: &str) -> Option<Consistent> {
        self.state.read().rings().get(actor_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(name: &str, entities: &[&str]) -> Vec<u8> {
        Command::Upsert(Member::new(
            name,
            "app",
            entities.iter().map(|e| e.to_string()).collect(),
        ))
        .encode()
        .unwrap()
    }

    #[test]
    fn test_apply_upsert_and_remove() {
        let fsm = PlacementFsm::new(10);
        assert!(fsm.apply(1, &upsert("h1", &["Dog"])).updated);
        assert_eq!(fsm.member_count(), 1);
        assert_eq!(fsm.table_generation(), 1);

        let remove = Command::Remove("h1".to_string()).encode().unwrap();
        assert!(fsm.apply(2, &remove).updated);
        assert_eq!(fsm.member_count(), 0);
        assert_eq!(fsm.table_generation(), 2);
        assert_eq!(fsm.index(), 2);
    }

    #[test]
    fn test_stale_index_is_skipped() {
        let fsm = PlacementFsm::new(10);
        fsm.apply(5, &upsert("h1", &["Dog"]));
        assert!(!fsm.apply(3, &upsert("h2", &["Dog"])).updated);
        assert_eq!(fsm.member_count(), 1);
        assert_eq!(fsm.index(), 5);
    }

    #[test]
    fn test_bad_entry_is_noop_but_advances_index() {
        let fsm = PlacementFsm::new(10);
        assert!(!fsm.apply(1, &[42, 0x80]).updated);
        assert!(!fsm.apply(2, &[]).updated);
        assert_eq!(fsm.index(), 2);
        assert_eq!(fsm.table_generation(), 0);
    }

    #[test]
    fn test_disseminate_does_not_touch_state() {
        let fsm = PlacementFsm::new(10);
        fsm.apply(1, &upsert("h1", &["Dog"]));
        let entry = Command::Disseminate.encode().unwrap();
        assert!(!fsm.apply(2, &entry).updated);
        assert_eq!(fsm.table_generation(), 1);
        assert_eq!(fsm.index(), 2);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let fsm = PlacementFsm::new(10);
        fsm.apply(1, &upsert("h1", &["Dog"]));
        let snap = fsm.snapshot();
        fsm.apply(2, &upsert("h2", &["Dog"]));

        assert_eq!(snap.members.len(), 1);
        assert!(snap.rings().is_empty());
        assert_eq!(fsm.member_count(), 2);
    }

    #[test]
    fn test_restore_replaces_state() {
        let source = PlacementFsm::new(10);
        source.apply(1, &upsert("h1", &["Dog", "Cat"]));
        source.apply(2, &upsert("h2", &["Cat"]));
        let bytes = source.persist().unwrap();

        let target = PlacementFsm::new(10);
        target.apply(1, &upsert("other", &["Bird"]));
        target.restore(&bytes).unwrap();

        assert_eq!(target.member_count(), 2);
        assert!(target.member("other").is_none());
        assert_eq!(target.index(), 2);
        assert_eq!(
            target.ring("Cat").unwrap().sorted_set(),
            source.ring("Cat").unwrap().sorted_set()
        );
        assert!(target.ring("Bird").is_none());
        assert_eq!(target.placement_tables(), source.placement_tables());
    }
}
