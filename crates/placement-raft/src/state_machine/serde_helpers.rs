//! Serialization helpers for bincode 2.x API compatibility.
//!
//! Raft log entries, votes and RPC payloads go through these helpers.
//! Domain snapshots use MessagePack instead (see [`super::MemberState`]).

use crate::error::RaftError;
use serde::{de::DeserializeOwned, Serialize};

/// Encode a value to bytes using bincode.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RaftError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RaftError::Serialization(e.to_string()))
}

/// Decode a value from bytes using bincode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RaftError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RaftError::Serialization(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_payload_membership_survives_encoding() {
        use crate::storage::{PlacementNode, PlacementTypeConfig};
        use openraft::{EntryPayload, Membership};
        use std::collections::BTreeMap;

        let mut nodes = BTreeMap::new();
        nodes.insert(1u64, PlacementNode::new("node-a", "127.0.0.1:8201"));
        nodes.insert(2u64, PlacementNode::new("node-b", "127.0.0.1:8202"));
        let membership: Membership<u64, PlacementNode> = nodes.into();
        let payload: EntryPayload<PlacementTypeConfig> = EntryPayload::Membership(membership);

        let bytes = encode(&payload).unwrap();
        let decoded: EntryPayload<PlacementTypeConfig> = decode(&bytes).unwrap();

        match decoded {
            EntryPayload::Membership(m) => assert_eq!(m.nodes().count(), 2),
            _ => panic!("Decoded payload type mismatch"),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<String, _> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
