//! Membership log and state machine storage for openraft's v1 `RaftStorage`.
//!
//! Committed entries are applied into [`PlacementFsm`]; snapshots are the
//! MessagePack FSM snapshot framed with Raft metadata.
//!
//! All state lives in memory; when a [`DiskStore`] is attached every
//! mutation is first written through to RocksDB and reloaded on open.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftStorage, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership, Vote,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::commands::ApplyResponse;
use crate::error::Result;
use crate::state_machine::{decode, encode, PlacementFsm};
use crate::storage::disk::DiskStore;
use crate::storage::types::{PlacementNode, PlacementTypeConfig};

/// Stored snapshot data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<u64, PlacementNode>,
    pub data: Vec<u8>,
}

/// Log entry stored in memory (and on disk when persistent)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntryData {
    log_id: LogId<u64>,
    payload: Vec<u8>,
}

/// Snapshot body: Raft metadata plus the FSM's MessagePack snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StateMachineData {
    last_applied_log: Option<LogId<u64>>,
    last_membership: StoredMembership<u64, PlacementNode>,
    state: Vec<u8>,
}

/// Raft log, vote and applied-state bookkeeping around the placement FSM
pub struct PlacementRaftStorage {
    /// Entries by log index
    log: RwLock<BTreeMap<u64, LogEntryData>>,

    vote: RwLock<Option<Vote<u64>>>,

    committed: RwLock<Option<LogId<u64>>>,

    last_purged: RwLock<Option<LogId<u64>>>,

    /// The membership FSM (shared with the placement service for reads)
    fsm: Arc<PlacementFsm>,

    last_applied: RwLock<Option<LogId<u64>>>,

    last_membership: RwLock<StoredMembership<u64, PlacementNode>>,

    snapshot_idx: AtomicU64,

    current_snapshot: RwLock<Option<StoredSnapshot>>,

    /// Write-through persistence; `None` for the in-memory store
    disk: Option<DiskStore>,
}

impl Debug for PlacementRaftStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementRaftStorage")
            .field("persistent", &self.disk.is_some())
            .field("snapshot_idx", &self.snapshot_idx)
            .finish_non_exhaustive()
    }
}

impl PlacementRaftStorage {
    /// Create an in-memory storage
    pub fn new(fsm: Arc<PlacementFsm>) -> Self {
        Self {
            log: RwLock::new(BTreeMap::new()),
            vote: RwLock::new(None),
            committed: RwLock::new(None),
            last_purged: RwLock::new(None),
            fsm,
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
            disk: None,
        }
    }

    /// Open a RocksDB-backed storage, reloading any prior state from `dir`.
    ///
    /// The FSM is restored from the last snapshot; entries after it are
    /// re-applied by openraft from the reloaded log.
    pub fn open(dir: impl AsRef<Path>, fsm: Arc<PlacementFsm>) -> Result<Self> {
        let disk = DiskStore::open(dir.as_ref())?;
        let mut storage = Self::new(fsm);

        *storage.vote.get_mut() = disk.load_vote::<Option<Vote<u64>>>()?.flatten();
        *storage.committed.get_mut() = disk.load_committed::<Option<LogId<u64>>>()?.flatten();
        *storage.last_purged.get_mut() = disk.load_purged::<Option<LogId<u64>>>()?.flatten();
        *storage.log.get_mut() = disk.load_entries::<LogEntryData>()?;

        if let Some(snapshot) = disk.load_snapshot::<StoredSnapshot>()? {
            let sm_data: StateMachineData = decode(&snapshot.data)?;
            if !sm_data.state.is_empty() {
                storage.fsm.restore(&sm_data.state)?;
            }
            *storage.last_applied.get_mut() = snapshot.meta.last_log_id;
            *storage.last_membership.get_mut() = snapshot.meta.last_membership.clone();
            *storage.current_snapshot.get_mut() = Some(snapshot);
        }

        log::info!(
            "Opened raft store at {}: {} log entries, snapshot at {:?}",
            disk.dir().display(),
            storage.log.get_mut().len(),
            storage.last_applied.get_mut()
        );

        storage.disk = Some(disk);
        Ok(storage)
    }

    /// The placement FSM fed by this store
    pub fn fsm(&self) -> &Arc<PlacementFsm> {
        &self.fsm
    }

    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// True if this node has never voted nor stored a log entry or snapshot
    pub fn is_pristine(&self) -> bool {
        self.vote.read().is_none()
            && self.log.read().is_empty()
            && self.current_snapshot.read().is_none()
    }

    fn get_log_entries_sync(&self, range: impl RangeBounds<u64>) -> Vec<Entry<PlacementTypeConfig>> {
        let log = self.log.read();
        log.range(range)
            .map(|(_, entry)| match decode::<EntryPayload<PlacementTypeConfig>>(&entry.payload) {
                Ok(payload) => Entry {
                    log_id: entry.log_id,
                    payload,
                },
                Err(e) => {
                    log::warn!("Failed to decode log entry {}: {:?}", entry.log_id.index, e);
                    Entry {
                        log_id: entry.log_id,
                        payload: EntryPayload::Blank,
                    }
                }
            })
            .collect()
    }

    fn remove_entries(&self, log: &mut BTreeMap<u64, LogEntryData>, keys: Vec<u64>) -> Result<()> {
        if let Some(disk) = &self.disk {
            disk.remove_entries(&keys)?;
        }
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<()> {
        if let Some(disk) = &self.disk {
            disk.save_snapshot(&snapshot)?;
        }
        *self.current_snapshot.write() = Some(snapshot);
        Ok(())
    }
}

/// Read handle handed to openraft's replication tasks
#[derive(Clone)]
pub struct PlacementLogReader {
    storage: Arc<PlacementRaftStorage>,
}

impl RaftLogReader<PlacementTypeConfig> for PlacementLogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<PlacementTypeConfig>>, StorageError<u64>> {
        Ok(self.storage.get_log_entries_sync(range))
    }
}

/// Snapshot builder that serializes the FSM
pub struct PlacementSnapshotBuilder {
    storage: Arc<PlacementRaftStorage>,
}

impl RaftSnapshotBuilder<PlacementTypeConfig> for PlacementSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> std::result::Result<Snapshot<PlacementTypeConfig>, StorageError<u64>> {
        let last_applied = *self.storage.last_applied.read();
        let last_membership = self.storage.last_membership.read().clone();

        let state = self
            .storage
            .fsm
            .persist()
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let data = StateMachineData {
            last_applied_log: last_applied,
            last_membership: last_membership.clone(),
            state,
        };
        let serialized = encode(&data).map_err(|e| StorageIOError::read_state_machine(&e))?;

        let snapshot_idx = self.storage.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        self.storage
            .store_snapshot(StoredSnapshot {
                meta: meta.clone(),
                data: serialized.clone(),
            })
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        log::debug!("Built placement snapshot {}", meta.snapshot_id);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(serialized)),
        })
    }
}

impl RaftLogReader<PlacementTypeConfig> for Arc<PlacementRaftStorage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<PlacementTypeConfig>>, StorageError<u64>> {
        Ok(self.get_log_entries_sync(range))
    }
}

#[allow(deprecated)]
impl RaftStorage<PlacementTypeConfig> for Arc<PlacementRaftStorage> {
    type LogReader = PlacementLogReader;
    type SnapshotBuilder = PlacementSnapshotBuilder;

    // vote

    async fn save_vote(&mut self, vote: &Vote<u64>) -> std::result::Result<(), StorageError<u64>> {
        if let Some(disk) = &self.disk {
            disk.save_vote(&Some(vote.clone()))
                .map_err(|e| StorageIOError::write_vote(&e))?;
        }
        *self.vote.write() = Some(vote.clone());
        Ok(())
    }

    async fn read_vote(&mut self) -> std::result::Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(self.vote.read().clone())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> std::result::Result<(), StorageError<u64>> {
        if let Some(disk) = &self.disk {
            disk.save_committed(&committed)
                .map_err(|e| StorageIOError::write(&e))?;
        }
        *self.committed.write() = committed;
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> std::result::Result<Option<LogId<u64>>, StorageError<u64>> {
        Ok(*self.committed.read())
    }

    // log

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<LogState<PlacementTypeConfig>, StorageError<u64>> {
        let log = self.log.read();
        let last_purged = *self.last_purged.read();
        let last_log_id = log.iter().next_back().map(|(_, e)| e.log_id).or(last_purged);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        PlacementLogReader {
            storage: self.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> std::result::Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<PlacementTypeConfig>> + OptionalSend,
    {
        let mut batch = Vec::new();
        for entry in entries {
            let payload = encode(&entry.payload).map_err(|e| StorageIOError::write_logs(&e))?;
            batch.push(LogEntryData {
                log_id: entry.log_id,
                payload,
            });
        }

        let mut log = self.log.write();
        if let Some(disk) = &self.disk {
            disk.append_entries(batch.iter().map(|data| (data.log_id.index, data)))
                .map_err(|e| StorageIOError::write_logs(&e))?;
        }
        for data in batch {
            log.insert(data.log_id.index, data);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> std::result::Result<(), StorageError<u64>> {
        let mut log = self.log.write();
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        self.remove_entries(&mut log, keys)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<u64>,
    ) -> std::result::Result<(), StorageError<u64>> {
        let mut log = self.log.write();
        let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();

        if let Some(disk) = &self.disk {
            disk.save_purged(&Some(log_id))
                .map_err(|e| StorageIOError::write_logs(&e))?;
        }
        *self.last_purged.write() = Some(log_id);
        self.remove_entries(&mut log, keys)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    // apply

    async fn last_applied_state(
        &mut self,
    ) -> std::result::Result<
        (Option<LogId<u64>>, StoredMembership<u64, PlacementNode>),
        StorageError<u64>,
    > {
        let last_applied = *self.last_applied.read();
        let last_membership = self.last_membership.read().clone();
        Ok((last_applied, last_membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<PlacementTypeConfig>],
    ) -> std::result::Result<Vec<ApplyResponse>, StorageError<u64>> {
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            *self.last_applied.write() = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => results.push(ApplyResponse::default()),
                EntryPayload::Normal(data) => {
                    results.push(self.fsm.apply(entry.log_id.index, data));
                }
                EntryPayload::Membership(mem) => {
                    *self.last_membership.write() =
                        StoredMembership::new(Some(entry.log_id), mem.clone());
                    results.push(ApplyResponse::default());
                }
            }
        }

        Ok(results)
    }

    // snapshots

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        PlacementSnapshotBuilder {
            storage: self.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, PlacementNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();

        let sm_data: StateMachineData = decode(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        if sm_data.state.is_empty() {
            self.fsm.reset();
        } else {
            self.fsm
                .restore(&sm_data.state)
                .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
        }

        *self.last_applied.write() = meta.last_log_id;
        *self.last_membership.write() = meta.last_membership.clone();

        self.store_snapshot(StoredSnapshot {
            meta: meta.clone(),
            data,
        })
        .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        if let Some(last_log_id) = meta.last_log_id {
            let mut log = self.log.write();
            let keys: Vec<u64> = log.range(..=last_log_id.index).map(|(k, _)| *k).collect();
            if let Some(disk) = &self.disk {
                disk.save_purged(&Some(last_log_id))
                    .map_err(|e| StorageIOError::write_logs(&e))?;
            }
            *self.last_purged.write() = Some(last_log_id);
            self.remove_entries(&mut log, keys)
                .map_err(|e| StorageIOError::write_logs(&e))?;
        }

        log::info!("Installed placement snapshot {}", meta.snapshot_id);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<PlacementTypeConfig>>, StorageError<u64>> {
        let current = self.current_snapshot.read();
        Ok(current.as_ref().map(|snapshot| Snapshot {
            meta: snapshot.meta.clone(),
            snapshot: Box::new(Cursor::new(snapshot.data.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Command, Member};
    use openraft::CommittedLeaderId;

    fn upsert_entry(index: u64, name: &str) -> Entry<PlacementTypeConfig> {
        let cmd = Command::Upsert(Member::new(name, "app", vec!["Dog".to_string()]));
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(cmd.encode().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_storage_creation() {
        let mut storage = Arc::new(PlacementRaftStorage::new(Arc::new(PlacementFsm::new(10))));
        let (last_applied, _) = storage.last_applied_state().await.unwrap();
        assert!(last_applied.is_none());
        assert!(storage.is_pristine());
    }

    #[tokio::test]
    async fn test_vote_operations() {
        let mut storage = Arc::new(PlacementRaftStorage::new(Arc::new(PlacementFsm::new(10))));
        assert!(storage.read_vote().await.unwrap().is_none());

        let vote = Vote::new(1, 1);
        storage.save_vote(&vote).await.unwrap();
        assert_eq!(storage.read_vote().await.unwrap(), Some(vote));
        assert!(!storage.is_pristine());
    }

    #[tokio::test]
    async fn test_apply_reaches_fsm() {
        let fsm = Arc::new(PlacementFsm::new(10));
        let mut storage = Arc::new(PlacementRaftStorage::new(fsm.clone()));

        let entries = vec![upsert_entry(1, "h1"), upsert_entry(2, "h2")];
        storage.append_to_log(entries.clone()).await.unwrap();
        let results = storage.apply_to_state_machine(&entries).await.unwrap();

        assert_eq!(results, vec![ApplyResponse { updated: true }; 2]);
        assert_eq!(fsm.member_count(), 2);
        let (last_applied, _) = storage.last_applied_state().await.unwrap();
        assert_eq!(last_applied.map(|l| l.index), Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_install_restores_fsm() {
        let source_fsm = Arc::new(PlacementFsm::new(10));
        let mut source = Arc::new(PlacementRaftStorage::new(source_fsm));
        let entries = vec![upsert_entry(1, "h1"), upsert_entry(2, "h2")];
        source.apply_to_state_machine(&entries).await.unwrap();

        let mut builder = source.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();

        let target_fsm = Arc::new(PlacementFsm::new(10));
        let mut target = Arc::new(PlacementRaftStorage::new(target_fsm.clone()));
        target
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(target_fsm.member_count(), 2);
        assert_eq!(target_fsm.table_generation(), 2);
        assert!(target.get_current_snapshot().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_backed_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fsm = Arc::new(PlacementFsm::new(10));
            let mut storage = Arc::new(PlacementRaftStorage::open(dir.path(), fsm).unwrap());
            storage.save_vote(&Vote::new(2, 1)).await.unwrap();
            let entries = vec![upsert_entry(1, "h1"), upsert_entry(2, "h2"), upsert_entry(3, "h3")];
            storage.append_to_log(entries.clone()).await.unwrap();
            storage.apply_to_state_machine(&entries[..2]).await.unwrap();
            storage.get_snapshot_builder().await.build_snapshot().await.unwrap();
            storage
                .purge_logs_upto(LogId::new(CommittedLeaderId::new(1, 1), 1))
                .await
                .unwrap();
        }

        let fsm = Arc::new(PlacementFsm::new(10));
        let mut storage = Arc::new(PlacementRaftStorage::open(dir.path(), fsm.clone()).unwrap());
        assert_eq!(storage.read_vote().await.unwrap(), Some(Vote::new(2, 1)));

        // snapshot covered h1 and h2; entry 3 is still in the log
        assert_eq!(fsm.member_count(), 2);
        let (last_applied, _) = storage.last_applied_state().await.unwrap();
        assert_eq!(last_applied.map(|l| l.index), Some(2));

        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(1));
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));
        let remaining = storage.try_get_log_entries(2..).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
