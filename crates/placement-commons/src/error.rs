//! Error types shared across placement crates

use thiserror::Error;

/// Errors returned by the consistent hash ring
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashingError {
    /// The ring has no hosts
    #[error("no hosts added")]
    NoHosts,

    /// The requested host is not a member of the ring
    #[error("host not found: {0}")]
    HostNotFound(String),
}

/// Errors raised while loading the mTLS credential triplet
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// One of the PEM files is missing from the credentials directory
    #[error("credential file missing: {0}")]
    Missing(String),

    /// Reading a PEM file failed
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The triplet did not appear before the deadline
    #[error("timed out after {0:?} waiting for credentials")]
    Timeout(std::time::Duration),
}
