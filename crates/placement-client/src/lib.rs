//! Host-side placement client
//!
//! [`ActorPlacement`] keeps one stream to the placement leader, heartbeats
//! the host's actor types, and applies lock/update/unlock orders so
//! [`ActorPlacement::lookup_actor`] never observes a half-installed table.

pub mod config;
pub mod error;
pub mod placement;

pub use config::{add_dns_resolver_prefix, PlacementClientConfig, DNS_RESOLVER_PREFIX};
pub use error::{ClientError, Result};
pub use placement::ActorPlacement;
