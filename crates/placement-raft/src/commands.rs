//! Replicated membership commands
//!
//! A command on the Raft log is one tag byte followed by a MessagePack map
//! of the member:
//!
//! ```text
//! [tag:u8][msgpack {"Name", "AppID", "Entities", "UpdatedAt"}]
//! ```
//!
//! | Tag | Command            | Payload used        |
//! |-----|--------------------|---------------------|
//! | 0   | `MemberUpsert`     | whole member        |
//! | 1   | `MemberRemove`     | `Name` only         |
//! | 100 | `TableDisseminate` | none (empty member) |

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// One-byte command tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandTag {
    MemberUpsert = 0,
    MemberRemove = 1,
    TableDisseminate = 100,
}

impl TryFrom<u8> for CommandTag {
    type Error = RaftError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CommandTag::MemberUpsert),
            1 => Ok(CommandTag::MemberRemove),
            100 => Ok(CommandTag::TableDisseminate),
            other => Err(RaftError::UnknownCommand(other)),
        }
    }
}

/// A runtime host in the membership table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Member {
    /// `host:port` identity
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "AppID", default)]
    pub app_id: String,

    /// Actor types served by the host
    #[serde(rename = "Entities", default)]
    pub entities: Vec<String>,

    /// Unix nanos of the last heartbeat, stamped by the leader
    #[serde(rename = "UpdatedAt", default)]
    pub updated_at: i64,
}

impl Member {
    pub fn new(
        name: impl Into<String>,
        app_id: impl Into<String>,
        entities: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            app_id: app_id.into(),
            entities,
            updated_at: 0,
        }
    }

    /// True if the two members describe the same placement
    /// (everything but `updated_at` matches)
    pub fn same_placement(&self, other: &Member) -> bool {
        self.name == other.name && self.app_id == other.app_id && self.entities == other.entities
    }
}

/// Membership command replicated through Raft
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Insert or replace the named member
    Upsert(Member),
    /// Remove a member by name
    Remove(String),
    /// Leader heartbeat entry; never changes membership
    Disseminate,
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::Upsert(_) => CommandTag::MemberUpsert,
            Command::Remove(_) => CommandTag::MemberRemove,
            Command::Disseminate => CommandTag::TableDisseminate,
        }
    }

    /// Encode to the on-log representation
    pub fn encode(&self) -> Result<Vec<u8>> {
        let member = match self {
            Command::Upsert(m) => m.clone(),
            Command::Remove(name) => Member {
                name: name.clone(),
                ..Default::default()
            },
            Command::Disseminate => Member::default(),
        };

        let body = rmp_serde::to_vec_named(&member)?;
        let mut buf = Vec::with_capacity(body.len() + 1);
        buf.push(self.tag() as u8);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode from the on-log representation, rejecting unknown tags
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (tag, body) = buf
            .split_first()
            .ok_or_else(|| RaftError::Serialization("empty command buffer".to_string()))?;

        match CommandTag::try_from(*tag)? {
            CommandTag::MemberUpsert => Ok(Command::Upsert(rmp_serde::from_slice(body)?)),
            CommandTag::MemberRemove => {
                let member: Member = rmp_serde::from_slice(body)?;
                Ok(Command::Remove(member.name))
            }
            CommandTag::TableDisseminate => Ok(Command::Disseminate),
        }
    }
}

/// Result of applying one log entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// The placement table changed (generation was bumped)
    pub updated: bool,
}
