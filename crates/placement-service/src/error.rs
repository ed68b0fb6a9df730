//! Error types for the placement server

use placement_commons::CredentialsError;
use placement_raft::RaftError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Placement service is not the leader")]
    NotLeader,

    #[error("Raft error: {0}")]
    Raft(#[from] RaftError),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Placement service is shutting down")]
    ShuttingDown,
}

impl ServiceError {
    pub fn config(msg: impl Into<String>) -> Self {
        ServiceError::Config(msg.into())
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotLeader => tonic::Status::failed_precondition(err.to_string()),
            ServiceError::Raft(inner) => inner.into(),
            ServiceError::ShuttingDown | ServiceError::Transport(_) => {
                tonic::Status::unavailable(err.to_string())
            }
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}
