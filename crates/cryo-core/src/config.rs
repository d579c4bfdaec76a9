//! Freezer configuration.

use serde::{Deserialize, Serialize};

use crate::error::FreezerError;

/// Maximum allowed capacity for the status-change event channel.
///
/// Bounds allocation when the configuration comes from untrusted input.
pub const MAX_EVENT_CAPACITY: usize = 1 << 20;

/// Maximum allowed value for the registered-group limit.
pub const MAX_GROUP_LIMIT: usize = 1 << 24;

/// Freezer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezerConfig {
    /// Capacity of the status-change event channel.
    ///
    /// Emission never blocks bookkeeping: when the channel is full the
    /// oldest pending event is dropped to make room.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Maximum number of groups that may be registered at once.
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,
}

const fn default_event_capacity() -> usize {
    256
}

const fn default_max_groups() -> usize {
    65_536
}

impl Default for FreezerConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            max_groups: default_max_groups(),
        }
    }
}

impl FreezerConfig {
    /// Validate the configuration bounds.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::InvalidConfig`] when a field is zero or
    /// exceeds its hard ceiling.
    pub fn validate(&self) -> Result<(), FreezerError> {
        if self.event_capacity == 0 || self.event_capacity > MAX_EVENT_CAPACITY {
            return Err(FreezerError::InvalidConfig {
                field: "event_capacity",
                reason: format!(
                    "must be in 1..={MAX_EVENT_CAPACITY}, got {}",
                    self.event_capacity
                ),
            });
        }
        if self.max_groups == 0 || self.max_groups > MAX_GROUP_LIMIT {
            return Err(FreezerError::InvalidConfig {
                field: "max_groups",
                reason: format!("must be in 1..={MAX_GROUP_LIMIT}, got {}", self.max_groups),
            });
        }
        Ok(())
    }
}
