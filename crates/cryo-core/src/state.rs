//! Per-group and per-task freeze bookkeeping records.
//!
//! All fields here are mutated only by the controller walk, the per-task
//! driver, and the migration path, and always under the freezer's
//! bookkeeping lock. Counter underflow and negative depth indicate a
//! lock-discipline bug, not a runtime condition; they abort with diagnostic
//! state rather than continuing with corrupted completion reporting.

use serde::{Deserialize, Serialize};

use crate::hierarchy::{GroupId, TaskId};

/// Per-group freeze bookkeeping.
///
/// `self_freeze` is the explicit administrative intent recorded on this
/// group; `freeze_requested` is the effective per-group freeze obligation,
/// set on every descendant during a request walk. Between walks
/// `freeze_requested == (nested_freeze_depth > 0)` holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GroupFreezeState {
    /// Administrative intent set on this group itself.
    pub self_freeze: bool,

    /// Effective freeze obligation (own or inherited).
    pub freeze_requested: bool,

    /// Aggregate status: this group and its whole subtree are quiesced.
    pub frozen: bool,

    /// Number of active freeze requests applying here (own + ancestors).
    pub nested_freeze_depth: i64,

    /// Directly owned tasks currently frozen.
    pub frozen_task_count: u64,

    /// Transitive descendant groups currently frozen.
    pub frozen_descendant_count: u64,
}

impl GroupFreezeState {
    /// Inherit the effective obligation of a parent at creation time.
    pub(crate) fn child_of(parent: &Self) -> Self {
        Self {
            nested_freeze_depth: parent.nested_freeze_depth,
            freeze_requested: parent.freeze_requested,
            ..Self::default()
        }
    }

    /// Evaluate the aggregate frozen condition against live tree counts.
    pub(crate) fn evaluate(&self, own_task_count: u64, descendant_count: u64) -> bool {
        self.freeze_requested
            && self.frozen_task_count == own_task_count
            && self.frozen_descendant_count == descendant_count
    }

    pub(crate) fn inc_frozen_tasks(&mut self) {
        self.frozen_task_count += 1;
    }

    pub(crate) fn dec_frozen_tasks(&mut self, group: GroupId) {
        assert!(
            self.frozen_task_count > 0,
            "frozen task count underflow for {group}: {self:?}"
        );
        self.frozen_task_count -= 1;
    }

    pub(crate) fn dec_frozen_descendants(&mut self, by: u64, group: GroupId) {
        assert!(
            self.frozen_descendant_count >= by,
            "frozen descendant count underflow for {group} (by {by}): {self:?}"
        );
        self.frozen_descendant_count -= by;
    }
}

/// Per-task freeze bookkeeping, mirroring the process's side of the state
/// machine: RUNNING -> FREEZE_REQUESTED (pending) -> FROZEN -> RUNNING, or
/// exit from any of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskFreezeState {
    /// The group this task currently belongs to.
    pub owning_group: GroupId,

    /// A quiesce request has been issued and not withdrawn.
    pub freeze_pending: bool,

    /// The task has reached the quiesced state.
    pub frozen: bool,

    /// Never frozen, never counted toward completion denominators.
    pub exempt: bool,
}

impl TaskFreezeState {
    pub(crate) fn new(owning_group: GroupId, exempt: bool) -> Self {
        Self {
            owning_group,
            freeze_pending: false,
            frozen: false,
            exempt,
        }
    }
}

/// All mutable freeze state, guarded by the freezer's bookkeeping lock.
#[derive(Debug, Default)]
pub(crate) struct Bookkeeping {
    pub groups: std::collections::HashMap<GroupId, GroupFreezeState>,
    pub tasks: std::collections::HashMap<TaskId, TaskFreezeState>,
}

/// Point-in-time snapshot of a group's freeze status.
///
/// May be stale by the time the caller acts on it; completion is
/// level-triggered and meant to be polled or observed via the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// The group this snapshot describes.
    pub group: GroupId,

    /// Administrative intent recorded on this group itself.
    pub self_freeze: bool,

    /// Effective freeze obligation (own or inherited from an ancestor).
    pub freeze_requested: bool,

    /// Aggregate status: the whole subtree is quiesced.
    pub frozen: bool,

    /// Number of active freeze requests applying to this group.
    pub nested_freeze_depth: i64,

    /// Directly owned tasks currently frozen.
    pub frozen_task_count: u64,

    /// Transitive descendant groups currently frozen.
    pub frozen_descendant_count: u64,
}
