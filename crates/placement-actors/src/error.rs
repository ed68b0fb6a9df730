//! Error types for local actor execution

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ActorError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorError {
    /// Reentrant call chain exceeded the configured depth
    #[error("Maximum stack depth exceeded")]
    MaxStackDepthExceeded,

    /// The actor was drained by a rebalance; the caller must reactivate it
    #[error("Actor is already disposed")]
    ActorDisposed,
}
