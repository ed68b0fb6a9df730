//! Placement server timing configuration

use std::time::Duration;

use crate::error::{Result, ServiceError};

/// Lowest accepted dissemination interval
pub const MIN_DISSEMINATION_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PlacementServiceConfig {
    /// Expected host heartbeat cadence; the faulty-host sweep runs at twice this
    pub heartbeat_interval: Duration,

    /// Tick of the lock/update/unlock dissemination loop
    pub dissemination_interval: Duration,

    /// Pause between `lock` and `update` so hosts can drain in-flight calls
    pub drain_grace: Duration,

    /// A member whose last heartbeat is older than this is removed
    pub faulty_host_timeout: Duration,

    /// Window in which consecutive membership changes are coalesced
    pub membership_batch_window: Duration,

    pub membership_channel_capacity: usize,
}

impl Default for PlacementServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            dissemination_interval: Duration::from_millis(2000),
            drain_grace: Duration::from_millis(200),
            faulty_host_timeout: Duration::from_millis(5000),
            membership_batch_window: Duration::from_millis(2),
            membership_channel_capacity: 100,
        }
    }
}

impl PlacementServiceConfig {
    pub fn sweep_interval(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Budget for pushing orders once the drain grace has elapsed; a whole
    /// rebalance finishes within `drain_grace + send_deadline()`
    pub fn send_deadline(&self) -> Duration {
        let margin = self.drain_grace + Duration::from_millis(10);
        self.dissemination_interval
            .checked_sub(margin)
            .filter(|d| !d.is_zero())
            .unwrap_or(MIN_DISSEMINATION_INTERVAL / 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dissemination_interval < MIN_DISSEMINATION_INTERVAL {
            return Err(ServiceError::config(format!(
                "dissemination interval {:?} is below the {:?} floor",
                self.dissemination_interval, MIN_DISSEMINATION_INTERVAL
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ServiceError::config("heartbeat interval must be non-zero"));
        }
        if self.faulty_host_timeout <= self.heartbeat_interval {
            return Err(ServiceError::config(
                "faulty host timeout must exceed the heartbeat interval",
            ));
        }
        if self.membership_channel_capacity == 0 {
            return Err(ServiceError::config("membership channel capacity must be > 0"));
        }
        Ok(())
    }
}
