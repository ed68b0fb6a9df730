//! Shared building blocks for the placement service
//!
//! - [`hashing`]: FNV-1a and the per-actor-type consistent hash ring
//! - [`proto`]: host-facing wire messages and the `Placement` gRPC service
//! - [`credentials`]: PEM triplet loading for mTLS

pub mod credentials;
pub mod error;
pub mod hashing;
pub mod proto;

pub use error::{CredentialsError, HashingError};
pub use hashing::{
    fnv1a_64, Consistent, ConsistentHashTables, HostInfo, DEFAULT_REPLICATION_FACTOR,
};
