//! Error types for the Raft layer

use thiserror::Error;

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur in the Raft layer
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader
    #[error("Not leader: leader is node {leader:?}")]
    NotLeader { leader: Option<u64> },

    /// Raft node not started
    #[error("Raft node not started: {0}")]
    NotStarted(String),

    /// Command buffer carried a tag this version does not know
    #[error("Unknown command tag: {0}")]
    UnknownCommand(u8),

    /// Failed to serialize/deserialize
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Proposal rejected by openraft
    #[error("Proposal rejected: {0}")]
    Proposal(String),

    /// Network error during Raft communication
    #[error("Network error: {0}")]
    Network(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command timeout
    #[error("Command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Raft is shutting down
    #[error("Raft is shutting down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Create a NotLeader error
    pub fn not_leader(leader: Option<u64>) -> Self {
        RaftError::NotLeader { leader }
    }

    /// Create a Storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        RaftError::Storage(msg.into())
    }

    /// Returns true if retrying might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. } | RaftError::Timeout(_) | RaftError::Network(_)
        )
    }

    /// Returns the leader hint if this is a NotLeader error
    pub fn leader_hint(&self) -> Option<u64> {
        if let RaftError::NotLeader { leader } = self {
            *leader
        } else {
            None
        }
    }
}

impl From<RaftError> for tonic::Status {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { .. } => tonic::Status::failed_precondition(err.to_string()),
            RaftError::Timeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            RaftError::Network(_) | RaftError::Shutdown => {
                tonic::Status::unavailable(err.to_string())
            }
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

impl From<bincode::error::EncodeError> for RaftError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RaftError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RaftError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for RaftError {
    fn from(err: rocksdb::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let status: tonic::Status = RaftError::not_leader(Some(2)).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = RaftError::Timeout(std::time::Duration::from_secs(5)).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = RaftError::UnknownCommand(7).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_retryable() {
        assert!(RaftError::not_leader(None).is_retryable());
        assert!(!RaftError::UnknownCommand(9).is_retryable());
        assert_eq!(RaftError::not_leader(Some(3)).leader_hint(), Some(3));
    }
}
