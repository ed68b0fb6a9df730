//! RocksDB persistence for the Raft storage
//!
//! Two column families under the store directory:
//!
//! - `raft_meta`: `vote`, `committed`, `purged` and `snapshot`, each a
//!   bincode value under its own key
//! - `raft_log`: bincode log entries keyed by the big-endian log index, so
//!   iteration order is index order
//!
//! Every write goes through one `WriteBatch` with a synced WAL; a call
//! returns only once the batch is durable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{RaftError, Result};
use crate::state_machine::{decode, encode};

const META_CF: &str = "raft_meta";
const LOG_CF: &str = "raft_log";

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const PURGED_KEY: &str = "purged";
const SNAPSHOT_KEY: &str = "snapshot";

/// Durable store backing a [`super::PlacementRaftStorage`]
#[derive(Clone)]
pub struct DiskStore {
    dir: PathBuf,
    db: Arc<DB>,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| RaftError::storage(format!("create {}: {}", dir.display(), e)))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [META_CF, LOG_CF]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, &dir, families)
            .map_err(|e| RaftError::storage(format!("open {}: {}", dir.display(), e)))?;

        Ok(Self {
            dir,
            db: Arc::new(db),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(META_CF)?, key.as_bytes(), encode(value)?);
        self.write_synced(batch)
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(META_CF)?, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_vote<T: Serialize>(&self, vote: &T) -> Result<()> {
        self.save(VOTE_KEY, vote)
    }

    pub fn load_vote<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.load(VOTE_KEY)
    }

    pub fn save_committed<T: Serialize>(&self, committed: &T) -> Result<()> {
        self.save(COMMITTED_KEY, committed)
    }

    pub fn load_committed<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.load(COMMITTED_KEY)
    }

    pub fn save_purged<T: Serialize>(&self, purged: &T) -> Result<()> {
        self.save(PURGED_KEY, purged)
    }

    pub fn load_purged<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.load(PURGED_KEY)
    }

    pub fn save_snapshot<T: Serialize>(&self, snapshot: &T) -> Result<()> {
        self.save(SNAPSHOT_KEY, snapshot)
    }

    pub fn load_snapshot<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.load(SNAPSHOT_KEY)
    }

    /// Write a run of entries atomically
    pub fn append_entries<'a, T, I>(&self, entries: I) -> Result<()>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (u64, &'a T)>,
    {
        let cf = self.cf(LOG_CF)?;
        let mut batch = WriteBatch::default();
        for (index, entry) in entries {
            batch.put_cf(cf, index.to_be_bytes(), encode(entry)?);
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.write_synced(batch)
    }

    /// Delete entries by index; missing indices are ignored
    pub fn remove_entries(&self, indices: &[u64]) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let cf = self.cf(LOG_CF)?;
        let mut batch = WriteBatch::default();
        for index in indices {
            batch.delete_cf(cf, index.to_be_bytes());
        }
        self.write_synced(batch)
    }

    /// Load every log entry, keyed by index
    pub fn load_entries<T: DeserializeOwned>(&self) -> Result<BTreeMap<u64, T>> {
        let mut entries = BTreeMap::new();
        for item in self.db.iterator_cf(self.cf(LOG_CF)?, IteratorMode::Start) {
            let (key, value) = item?;
            let Ok(raw) = <[u8; 8]>::try_from(key.as_ref()) else {
                log::warn!("Skipping raft log key of length {}", key.len());
                continue;
            };
            entries.insert(u64::from_be_bytes(raw), decode(&value)?);
        }
        Ok(entries)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RaftError::storage(format!("column family {} not found", name)))
    }

    fn write_synced(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(store.load_vote::<u64>().unwrap(), None);
        assert_eq!(store.load_snapshot::<String>().unwrap(), None);
        assert!(store.load_entries::<String>().unwrap().is_empty());
    }

    #[test]
    fn test_entries_and_vote_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).unwrap();
            let entries: Vec<String> = (1..=3).map(|i| format!("entry-{}", i)).collect();
            store
                .append_entries((1..=3u64).zip(entries.iter()))
                .unwrap();
            store.remove_entries(&[2, 99]).unwrap();
            store.save_vote(&7u64).unwrap();
            store.save_purged(&Some(0u64)).unwrap();
        }

        let store = DiskStore::open(dir.path()).unwrap();
        let entries: BTreeMap<u64, String> = store.load_entries().unwrap();
        assert_eq!(entries.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(entries[&3], "entry-3");
        assert_eq!(store.load_vote::<u64>().unwrap(), Some(7));
        assert_eq!(store.load_purged::<Option<u64>>().unwrap(), Some(Some(0)));
    }

    #[test]
    fn test_entries_load_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let values: Vec<u64> = vec![256, 1, 65_536, 2];
        store
            .append_entries(values.iter().map(|v| (*v, v)))
            .unwrap();

        let loaded: BTreeMap<u64, u64> = store.load_entries().unwrap();
        assert_eq!(loaded.keys().copied().collect::<Vec<_>>(), vec![1, 2, 256, 65_536]);
        assert!(loaded.iter().all(|(k, v)| k == v));
    }

    #[test]
    fn test_vote_overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.save_vote(&1u64).unwrap();
        store.save_vote(&2u64).unwrap();
        drop(store);

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(store.load_vote::<u64>().unwrap(), Some(2));
    }
}
