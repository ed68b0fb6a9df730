//! Consistent hashing for actor placement
//!
//! Every actor type gets its own ring. A host occupies `replication_factor`
//! virtual nodes on each ring it serves; the position of virtual node `i`
//! for host `name` is `fnv1a_64("{name}{i}")`.
//!
//! ## Lookup
//!
//! ```text
//! key ──fnv1a──▶ h ──▶ first vnode with hash >= h (wraps to index 0) ──▶ host
//! ```
//!
//! The hash function and vnode naming must stay stable across releases:
//! every host rebuilds the same ring from the same membership and resolves
//! actors locally, so two hosts that disagree on a hash disagree on where an
//! actor lives.
//!
//! ## Usage
//!
//! ```rust
//! use placement_commons::hashing::Consistent;
//!
//! let mut ring = Consistent::new(100);
//! ring.add("10.0.0.1:50002", "app-a", 50002);
//! ring.add("10.0.0.2:50002", "app-b", 50002);
//! let owner = ring.get("actor-42").unwrap();
//! assert!(owner.starts_with("10.0.0."));
//! ```

use std::collections::HashMap;

use crate::error::HashingError;
use crate::proto;

/// Virtual nodes per host per actor type unless configured otherwise
pub const DEFAULT_REPLICATION_FACTOR: usize = 100;

const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// Bounded-load slack over the average load per host
const LOAD_FACTOR: f64 = 1.25;

/// 64-bit FNV-1a over the raw bytes of `key`
pub fn fnv1a_64(key: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A host as seen by a ring
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostInfo {
    pub name: String,
    pub app_id: String,
    pub port: u32,
    pub load: i64,
}

impl HostInfo {
    pub fn new(name: impl Into<String>, app_id: impl Into<String>, port: u32) -> Self {
        Self {
            name: name.into(),
            app_id: app_id.into(),
            port,
            load: 0,
        }
    }
}

/// Consistent hash ring for a single actor type
#[derive(Debug, Clone)]
pub struct Consistent {
    /// vnode hash -> host name
    hosts: HashMap<u64, String>,
    /// All vnode hashes, ascending
    sorted_set: Vec<u64>,
    /// host name -> host metadata
    load_map: HashMap<String, HostInfo>,
    total_load: i64,
    replication_factor: usize,
}

impl Consistent {
    /// Create an empty ring placing `replication_factor` vnodes per host
    pub fn new(replication_factor: usize) -> Self {
        Self {
            hosts: HashMap::new(),
            sorted_set: Vec::new(),
            load_map: HashMap::new(),
            total_load: 0,
            replication_factor: replication_factor.max(1),
        }
    }

    /// Rebuild a ring verbatim from a disseminated table.
    ///
    /// The sorted set is taken as-is so a host serves exactly the ring the
    /// leader built, even if its own replication factor differs.
    pub fn from_table(table: &proto::PlacementTable, replication_factor: usize) -> Self {
        let mut sorted_set = table.sorted_set.clone();
        sorted_set.sort_unstable();
        sorted_set.dedup();

        let load_map = table
            .load_map
            .iter()
            .map(|(name, host)| {
                let info = HostInfo {
                    name: if host.name.is_empty() { name.clone() } else { host.name.clone() },
                    app_id: host.id.clone(),
                    port: host.port,
                    load: host.load,
                };
                (name.clone(), info)
            })
            .collect();

        Self {
            hosts: table.hosts.clone(),
            sorted_set,
            load_map,
            total_load: table.total_load,
            replication_factor: replication_factor.max(1),
        }
    }

    /// Export the ring in wire form
    pub fn to_table(&self) -> proto::PlacementTable {
        let load_map = self
            .load_map
            .iter()
            .map(|(name, info)| {
                let host = proto::Host {
                    name: info.name.clone(),
                    load: info.load,
                    entities: Vec::new(),
                    id: info.app_id.clone(),
                    port: info.port,
                };
                (name.clone(), host)
            })
            .collect();

        proto::PlacementTable {
            hosts: self.hosts.clone(),
            sorted_set: self.sorted_set.clone(),
            load_map,
            total_load: self.total_load,
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Add a host. Returns false if the host is already on the ring.
    ///
    /// Two hosts whose vnodes land on the same 64-bit slot collide; the later
    /// host takes the slot.
    pub fn add(&mut self, name: &str, app_id: &str, port: u32) -> bool {
        if self.load_map.contains_key(name) {
            return false;
        }

        self.load_map
            .insert(name.to_string(), HostInfo::new(name, app_id, port));

        for i in 0..self.replication_factor {
            let h = fnv1a_64(&format!("{}{}", name, i));
            if self.hosts.insert(h, name.to_string()).is_none() {
                self.sorted_set.push(h);
            }
        }
        self.sorted_set.sort_unstable();
        true
    }

    /// Remove a host and all of its vnodes. Returns false if it was absent.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(info) = self.load_map.remove(name) else {
            return false;
        };

        for i in 0..self.replication_factor {
            let h = fnv1a_64(&format!("{}{}", name, i));
            if self.hosts.get(&h).map(String::as_str) == Some(name) {
                self.hosts.remove(&h);
            }
        }
        let hosts = &self.hosts;
        self.sorted_set.retain(|h| hosts.contains_key(h));
        self.total_load = (self.total_load - info.load).max(0);
        true
    }

    /// Host owning `key`
    pub fn get(&self, key: &str) -> Result<&str, HashingError> {
        if self.sorted_set.is_empty() {
            return Err(HashingError::NoHosts);
        }
        let idx = self.search(fnv1a_64(key));
        self.hosts
            .get(&self.sorted_set[idx])
            .map(String::as_str)
            .ok_or(HashingError::NoHosts)
    }

    /// Metadata of the host owning `key`
    pub fn get_host(&self, key: &str) -> Result<&HostInfo, HashingError> {
        let name = self.get(key)?;
        self.load_map
            .get(name)
            .ok_or_else(|| HashingError::HostNotFound(name.to_string()))
    }

    /// Bounded-load lookup: the first successor of `key` whose load is
    /// within `max_load`. Falls back to the plain successor when every host
    /// is saturated.
    pub fn get_least(&self, key: &str) -> Result<&str, HashingError> {
        if self.sorted_set.is_empty() {
            return Err(HashingError::NoHosts);
        }

        let start = self.search(fnv1a_64(key));
        let mut idx = start;
        loop {
            if let Some(name) = self.hosts.get(&self.sorted_set[idx]) {
                if self.load_ok(name) {
                    return Ok(name);
                }
            }
            idx += 1;
            if idx >= self.sorted_set.len() {
                idx = 0;
            }
            if idx == start {
                return self.get(key);
            }
        }
    }

    /// Increment the load of `name`
    pub fn inc_load(&mut self, name: &str) {
        if let Some(info) = self.load_map.get_mut(name) {
            info.load += 1;
            self.total_load += 1;
        }
    }

    /// Decrement the load of `name`, never below zero
    pub fn done(&mut self, name: &str) {
        if let Some(info) = self.load_map.get_mut(name) {
            if info.load > 0 {
                info.load -= 1;
                self.total_load -= 1;
            }
        }
    }

    /// Set the load of `name` to an absolute value
    pub fn update_load(&mut self, name: &str, load: i64) {
        if let Some(info) = self.load_map.get_mut(name) {
            let load = load.max(0);
            self.total_load += load - info.load;
            info.load = load;
        }
    }

    /// Maximum load a host may carry before `get_least` skips it
    pub fn max_load(&self) -> i64 {
        if self.load_map.is_empty() {
            return 0;
        }
        let total = self.total_load.max(0) as f64;
        let avg = ((total + 1.0) / self.load_map.len() as f64).ceil().max(1.0);
        (avg * LOAD_FACTOR).ceil() as i64
    }

    pub fn load(&self, name: &str) -> Option<i64> {
        self.load_map.get(name).map(|h| h.load)
    }

    pub fn total_load(&self) -> i64 {
        self.total_load
    }

    /// Host metadata keyed by host name
    pub fn hosts(&self) -> &HashMap<String, HostInfo> {
        &self.load_map
    }

    pub fn sorted_set(&self) -> &[u64] {
        &self.sorted_set
    }

    pub fn contains(&self, name: &str) -> bool {
        self.load_map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.load_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.load_map.is_empty()
    }

    fn load_ok(&self, name: &str) -> bool {
        match self.load_map.get(name) {
            Some(info) => info.load + 1 <= self.max_load(),
            None => false,
        }
    }

    fn search(&self, key: u64) -> usize {
        let idx = self.sorted_set.partition_point(|h| *h < key);
        if idx >= self.sorted_set.len() {
            0
        } else {
            idx
        }
    }
}

/// The full set of rings a host resolves actors against
#[derive(Debug, Clone, Default)]
pub struct ConsistentHashTables {
    pub version: String,
    pub entries: HashMap<String, Consistent>,
}

impl ConsistentHashTables {
    /// Rebuild every ring from a disseminated placement table
    pub fn from_proto(tables: &proto::PlacementTables, replication_factor: usize) -> Self {
        let entries = tables
            .entries
            .iter()
            .map(|(actor_type, table)| {
                (actor_type.clone(), Consistent::from_table(table, replication_factor))
            })
            .collect();

        Self {
            version: tables.version.clone(),
            entries,
        }
    }

    pub fn to_proto(&self) -> proto::PlacementTables {
        proto::PlacementTables {
            entries: self
                .entries
                .iter()
                .map(|(k, ring)| (k.clone(), ring.to_table()))
                .collect(),
            version: self.version.clone(),
        }
    }
}

/// Trailing `:<port>` of a host name, if any
pub fn port_from_name(name: &str) -> u32 {
    name.rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u32>().ok())
        .unwrap_or(0)
}
