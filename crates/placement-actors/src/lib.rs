//! Turn-based concurrency for actors hosted on this runtime
//!
//! - [`ActorLock`]: per-actor async mutex with bounded reentrancy
//! - [`Actor`]: pending-call tracking, last-use time and a once-only
//!   dispose signal used while draining
//! - [`ActiveActors`]: local registry that drains actors whose placement
//!   moved to another host

pub mod active;
pub mod actor;
pub mod error;
pub mod lock;

pub use active::{placement_with_rebalancing, ActiveActors, ActorKey, PlacementLookup};
pub use actor::Actor;
pub use error::{ActorError, Result};
pub use lock::{ActorLock, DEFAULT_MAX_STACK_DEPTH};
