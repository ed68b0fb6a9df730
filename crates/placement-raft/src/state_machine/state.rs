//! Membership state and derived hash rings

use std::collections::HashMap;

use placement_commons::hashing::{port_from_name, Consistent};
use placement_commons::proto;
use serde::{Deserialize, Serialize};

use crate::commands::Member;
use crate::error::Result;

/// Replicated membership table.
///
/// Only `Index`, `TableGeneration` and `Members` are persisted; the rings
/// are rebuilt from the members on restore.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MemberState {
    /// Highest Raft index applied
    #[serde(rename = "Index")]
    pub index: u64,

    /// Bumped on every change to the ring set
    #[serde(rename = "TableGeneration")]
    pub table_generation: u64,

    #[serde(rename = "Members")]
    pub members: HashMap<String, Member>,

    /// actor type -> ring
    #[serde(skip)]
    rings: HashMap<String, Consistent>,

    #[serde(skip)]
    replication_factor: usize,
}

impl MemberState {
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor: replication_factor.max(1),
            ..Default::default()
        }
    }

    /// Copy of the persisted fields; the copy has no rings
    pub fn clone_members(&self) -> Self {
        Self {
            index: self.index,
            table_generation: self.table_generation,
            members: self.members.clone(),
            rings: HashMap::new(),
            replication_factor: self.replication_factor,
        }
    }

    pub fn rings(&self) -> &HashMap<String, Consistent> {
        &self.rings
    }

    /// Insert or replace a member. Returns true if the ring set changed.
    pub fn upsert_member(&mut self, member: &Member) -> bool {
        if member.entities.is_empty() {
            return false;
        }

        if let Some(existing) = self.members.get_mut(&member.name) {
            if existing.same_placement(member) {
                existing.updated_at = member.updated_at;
                return false;
            }
        }

        if let Some(old) = self.members.remove(&member.name) {
            self.remove_from_rings(&old);
        }
        self.add_to_rings(member);
        self.members.insert(member.name.clone(), member.clone());
        self.table_generation += 1;
        true
    }

    /// Remove a member by name. Returns true if it existed.
    pub fn remove_member(&mut self, name: &str) -> bool {
        match self.members.remove(name) {
            Some(old) => {
                self.remove_from_rings(&old);
                self.table_generation += 1;
                true
            }
            None => false,
        }
    }

    /// Rebuild every ring from the member map
    pub fn restore_hashing_tables(&mut self) {
        self.rings.clear();
        let members: Vec<Member> = self.members.values().cloned().collect();
        for m in &members {
            self.add_to_rings(m);
        }
    }

    /// Encode the persisted fields as MessagePack
    pub fn persist(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode a snapshot and rebuild its rings
    pub fn restore(bytes: &[u8], replication_factor: usize) -> Result<Self> {
        let mut state: MemberState = rmp_serde::from_slice(bytes)?;
        state.replication_factor = replication_factor.max(1);
        state.restore_hashing_tables();
        Ok(state)
    }

    /// Wire-form placement tables stamped with the current generation
    pub fn placement_tables(&self) -> proto::PlacementTables {
        proto::PlacementTables {
            entries: self
                .rings
                .iter()
                .map(|(actor_type, ring)| (actor_type.clone(), ring.to_table()))
                .collect(),
            version: self.table_generation.to_string(),
        }
    }

    fn add_to_rings(&mut self, member: &Member) {
        let rf = self.replication_factor;
        let port = port_from_name(&member.name);
        for entity in &member.entities {
            self.rings
                .entry(entity.clone())
                .or_insert_with(|| Consistent::new(rf))
                .add(&member.name, &member.app_id, port);
        }
    }

    fn remove_from_rings(&mut self, member: &Member) {
        for entity in &member.entities {
            if let Some(ring) = self.rings.get_mut(entity) {
                ring.remove(&member.name);
                if ring.is_empty() {
                    self.rings.remove(entity);
                }
            }
        }
    }
}
