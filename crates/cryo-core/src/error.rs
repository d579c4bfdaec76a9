//! Freezer-specific error types.
//!
//! Freeze and thaw are fire-and-forget: nothing here represents a failed
//! freeze. These errors cover caller mistakes (unknown or dead identifiers,
//! double registration, invalid configuration). Invariant violations such
//! as counter underflow are not errors; they indicate a lock-discipline bug
//! and abort with diagnostic state instead.

use thiserror::Error;

use crate::hierarchy::{GroupId, TaskId};

/// Errors that can occur during freezer bookkeeping operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FreezerError {
    /// The group is not registered with the freezer.
    #[error("unknown group: {group}")]
    UnknownGroup {
        /// The group that was not found.
        group: GroupId,
    },

    /// The group exists but is no longer live in the hierarchy.
    #[error("group {group} is not live")]
    DeadGroup {
        /// The group that is dead.
        group: GroupId,
    },

    /// The task is not registered with the freezer.
    #[error("unknown task: {task}")]
    UnknownTask {
        /// The task that was not found.
        task: TaskId,
    },

    /// A group with this identifier is already registered.
    #[error("group already registered: {group}")]
    GroupAlreadyRegistered {
        /// The duplicate group.
        group: GroupId,
    },

    /// A task with this identifier is already registered.
    #[error("task already registered: {task}")]
    TaskAlreadyRegistered {
        /// The duplicate task.
        task: TaskId,
    },

    /// A group can only be removed once it has no descendants and no tasks.
    #[error("group {group} still has descendants or tasks")]
    GroupNotEmpty {
        /// The non-empty group.
        group: GroupId,
    },

    /// Registering the group would exceed the configured group limit.
    #[error("group limit reached: {max}")]
    GroupLimitExceeded {
        /// The configured maximum number of groups.
        max: usize,
    },

    /// A configuration field is out of bounds.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Result type for freezer bookkeeping operations.
pub type FreezerResult<T> = Result<T, FreezerError>;
