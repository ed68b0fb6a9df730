//! Error types for the placement client

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No placement servers configured")]
    NoServers,

    #[error("Invalid placement address '{0}'")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Placement stream error: {0}")]
    Status(#[from] tonic::Status),

    #[error("Placement stream closed by server")]
    StreamClosed,

    #[error("Placement client stopped")]
    Stopped,
}

impl ClientError {
    /// True if reconnecting to the next peer may help
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::StreamClosed => true,
            ClientError::Status(status) => matches!(
                status.code(),
                tonic::Code::FailedPrecondition
                    | tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::Cancelled
                    | tonic::Code::Unknown
            ),
            _ => false,
        }
    }
}
