//! Placement state machine
//!
//! - [`MemberState`]: member map, generation counter and derived rings
//! - [`PlacementFsm`]: thread-safe wrapper applied by the Raft storage

mod fsm;
mod serde_helpers;
mod state;

pub use fsm::PlacementFsm;
pub use serde_helpers::{decode, encode};
pub use state::MemberState;
