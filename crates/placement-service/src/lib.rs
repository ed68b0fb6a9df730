//! Leader-side placement server
//!
//! - [`PlacementService`]: host stream pool, membership proposals,
//!   dissemination and faulty-host sweeping
//! - [`PlacementHandler`]: the `Placement` gRPC service mounted on tonic
//! - [`healthz`]: actix-web probe endpoints

pub mod config;
pub mod error;
pub mod healthz;

mod dissemination;
mod membership;
mod service;
mod stream;

pub use config::{PlacementServiceConfig, MIN_DISSEMINATION_INTERVAL};
pub use error::{Result, ServiceError};
pub use service::PlacementService;
pub use stream::PlacementHandler;
