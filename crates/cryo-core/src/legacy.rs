//! The self-contained per-subtree freezer with explicit freeze causes.
//!
//! An alternative to [`crate::Freezer`]'s depth counter: each group carries
//! an explicit [`LegacyState`] telling administrative tooling *which* cause
//! is active (a request on the group itself vs. one inherited from an
//! ancestor). The two encodings are equivalent; `freezing_self ||
//! freezing_parent` plays the role of `nested_freeze_depth > 0`.
//!
//! Additions over the core model:
//!
//! - a counter of groups anywhere in this freezer with any freezing cause
//!   active, maintained on the 0<->1 transitions of the freezing union, so
//!   power-management consumers get a cheap "is anything freezing" check;
//! - a record of the last administrative intent per subtree root, consulted
//!   when a process forks, so a child created after a freeze request but
//!   before it reached the child's group is frozen at fork completion and
//!   never observed running inside a supposedly frozen subtree.
//!
//! The aggregate `frozen` flag here is per group over its own tasks;
//! subtree-wide aggregation is the core model's job. Thawing affects
//! exactly the tasks owned by the walked groups, nothing broader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::driver::QuiesceBackend;
use crate::error::{FreezerError, FreezerResult};
use crate::hierarchy::{GroupHierarchy, GroupId, TaskId};

/// Explicit per-group freezer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyState {
    /// The group is fully set up and participates in walks.
    pub online: bool,

    /// A freeze request was made on this group itself.
    pub freezing_self: bool,

    /// An ancestor's freeze request applies to this group.
    pub freezing_parent: bool,

    /// Every directly owned, non-exempt task has quiesced while freezing.
    pub frozen: bool,
}

impl LegacyState {
    /// Whether any freezing cause is active.
    #[must_use]
    pub const fn freezing(&self) -> bool {
        self.freezing_self || self.freezing_parent
    }
}

/// Which cause a state change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    SelfRequest,
    Inherited,
}

#[derive(Debug, Clone, Copy)]
struct LegacyTask {
    group: GroupId,
    freeze_pending: bool,
    frozen: bool,
    exempt: bool,
}

#[derive(Debug, Default)]
struct LegacyInner {
    groups: HashMap<GroupId, LegacyState>,
    tasks: HashMap<TaskId, LegacyTask>,
    /// Last administrative intent per subtree root.
    intents: HashMap<GroupId, bool>,
}

/// Per-subtree freezer with explicit self/parent causes and fork-time
/// freeze enforcement.
pub struct LegacyFreezer<H, B> {
    hierarchy: H,
    backend: B,
    inner: Mutex<LegacyInner>,
    /// Serializes administrative walks against each other; never taken by
    /// fork/exit paths.
    walk: Mutex<()>,
    /// Groups with any freezing cause active.
    freezing_groups: AtomicU64,
}

impl<H: GroupHierarchy, B: QuiesceBackend> LegacyFreezer<H, B> {
    /// Create a legacy freezer over an externally owned tree and backend.
    pub fn new(hierarchy: H, backend: B) -> Self {
        Self {
            hierarchy,
            backend,
            inner: Mutex::new(LegacyInner::default()),
            walk: Mutex::new(()),
            freezing_groups: AtomicU64::new(0),
        }
    }

    /// Whether any group anywhere in this freezer is freezing.
    #[must_use]
    pub fn any_freezing(&self) -> bool {
        self.freezing_groups.load(Ordering::Relaxed) > 0
    }

    /// Number of groups with an active freezing cause.
    #[must_use]
    pub fn freezing_group_count(&self) -> u64 {
        self.freezing_groups.load(Ordering::Relaxed)
    }

    /// State snapshot of one group.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownGroup`] for an unregistered group.
    pub fn state(&self, group: GroupId) -> FreezerResult<LegacyState> {
        self.inner
            .lock()
            .groups
            .get(&group)
            .copied()
            .ok_or(FreezerError::UnknownGroup { group })
    }

    /// The last administrative intent recorded for a subtree root, if any.
    #[must_use]
    pub fn recorded_intent(&self, root: GroupId) -> Option<bool> {
        self.inner.lock().intents.get(&root).copied()
    }

    /// Register a group once the tree collaborator has linked it. It comes
    /// online inheriting its parent's freezing state as an inherited
    /// cause.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::GroupAlreadyRegistered`] on a duplicate id.
    pub fn group_added(&self, group: GroupId) -> FreezerResult<()> {
        let mut inner = self.inner.lock();
        if inner.groups.contains_key(&group) {
            return Err(FreezerError::GroupAlreadyRegistered { group });
        }
        let freezing_parent = self
            .hierarchy
            .parent(group)
            .and_then(|p| inner.groups.get(&p))
            .is_some_and(LegacyState::freezing);
        let state = LegacyState {
            online: true,
            freezing_self: false,
            freezing_parent,
            frozen: false,
        };
        if state.freezing() {
            self.freezing_groups.fetch_add(1, Ordering::Relaxed);
        }
        inner.groups.insert(group, state);
        Ok(())
    }

    /// Take a group offline and forget it. Its intent record, if it was a
    /// request root, is dropped with it.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownGroup`] for an unregistered group.
    pub fn group_removed(&self, group: GroupId) -> FreezerResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .groups
            .remove(&group)
            .ok_or(FreezerError::UnknownGroup { group })?;
        if state.freezing() {
            self.freezing_groups.fetch_sub(1, Ordering::Relaxed);
        }
        inner.intents.remove(&group);
        Ok(())
    }

    /// Register a task. If its group is already freezing, the task is
    /// frozen on arrival.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::TaskAlreadyRegistered`] on a duplicate id
    /// and [`FreezerError::UnknownGroup`] if `group` is not registered.
    pub fn task_attached(&self, task: TaskId, group: GroupId, exempt: bool) -> FreezerResult<()> {
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&task) {
            return Err(FreezerError::TaskAlreadyRegistered { task });
        }
        let freezing = inner
            .groups
            .get(&group)
            .ok_or(FreezerError::UnknownGroup { group })?
            .freezing();
        inner.tasks.insert(
            task,
            LegacyTask {
                group,
                freeze_pending: false,
                frozen: false,
                exempt,
            },
        );
        if freezing {
            self.freeze_task(&mut inner, task);
            self.update_frozen(&mut inner, group);
        }
        Ok(())
    }

    /// Register a freshly forked task, enforcing any freeze intent already
    /// issued for the subtree it landed in. This closes the race where the
    /// parent's freeze flag has not yet propagated to the child's group
    /// membership when the fork completes.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::TaskAlreadyRegistered`] on a duplicate id
    /// and [`FreezerError::UnknownGroup`] if `group` is not registered.
    pub fn task_forked(&self, task: TaskId, group: GroupId, exempt: bool) -> FreezerResult<()> {
        self.task_attached(task, group, exempt)?;
        let mut inner = self.inner.lock();
        if inner.tasks.get(&task).is_some_and(|t| t.frozen || t.freeze_pending) {
            return Ok(());
        }
        if self.governing_intent(&inner, group) == Some(true) {
            tracing::debug!(%task, %group, "fork-time freeze enforcement");
            self.freeze_task(&mut inner, task);
        }
        Ok(())
    }

    /// The intent recorded on the nearest ancestor-or-self request root.
    fn governing_intent(&self, inner: &LegacyInner, group: GroupId) -> Option<bool> {
        let mut cursor = Some(group);
        while let Some(id) = cursor {
            if let Some(intent) = inner.intents.get(&id) {
                return Some(*intent);
            }
            cursor = self.hierarchy.parent(id);
        }
        None
    }

    /// Freeze or thaw the subtree rooted at `root`.
    ///
    /// The whole pre-order walk runs under the walk lock, so two
    /// administrative requests can never interleave and leave causes
    /// inconsistent. Each descendant re-derives its inherited cause from
    /// its parent's current freezing union, which keeps independently
    /// requested descendants frozen when an ancestor thaws.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownGroup`] if `root` is not registered.
    pub fn set_freeze(&self, root: GroupId, freeze: bool) -> FreezerResult<()> {
        let _walk = self.walk.lock();
        {
            let mut inner = self.inner.lock();
            if !inner.groups.contains_key(&root) {
                return Err(FreezerError::UnknownGroup { group: root });
            }
            inner.intents.insert(root, freeze);
        }
        tracing::debug!(%root, freeze, "legacy freeze request");

        for descendant in self.hierarchy.descendants_preorder(root) {
            if !self.hierarchy.is_live(descendant) {
                continue;
            }
            let mut inner = self.inner.lock();
            if descendant == root {
                self.apply_state(&mut inner, descendant, freeze, Cause::SelfRequest);
            } else {
                let parent_freezing = self
                    .hierarchy
                    .parent(descendant)
                    .and_then(|p| inner.groups.get(&p))
                    .is_some_and(LegacyState::freezing);
                self.apply_state(&mut inner, descendant, parent_freezing, Cause::Inherited);
            }
        }
        Ok(())
    }

    /// Set or clear one cause on one group and act on its tasks.
    fn apply_state(&self, inner: &mut LegacyInner, group: GroupId, freeze: bool, cause: Cause) {
        let Some(state) = inner.groups.get_mut(&group) else {
            return;
        };
        if !state.online {
            return;
        }

        if freeze {
            if !state.freezing() {
                self.freezing_groups.fetch_add(1, Ordering::Relaxed);
            }
            match cause {
                Cause::SelfRequest => state.freezing_self = true,
                Cause::Inherited => state.freezing_parent = true,
            }
            for task in self.hierarchy.tasks_of(group) {
                self.freeze_task(inner, task);
            }
            self.update_frozen(inner, group);
        } else {
            let was_freezing = state.freezing();
            match cause {
                Cause::SelfRequest => state.freezing_self = false,
                Cause::Inherited => state.freezing_parent = false,
            }
            if !state.freezing() {
                if was_freezing {
                    self.freezing_groups.fetch_sub(1, Ordering::Relaxed);
                }
                state.frozen = false;
                // Exactly this group's tasks; intent never broadens past
                // the walked subtree.
                for task in self.hierarchy.tasks_of(group) {
                    self.thaw_task(inner, task);
                }
            }
        }
    }

    fn freeze_task(&self, inner: &mut LegacyInner, task: TaskId) {
        let Some(state) = inner.tasks.get_mut(&task) else {
            return;
        };
        if state.exempt || state.frozen || state.freeze_pending {
            return;
        }
        state.freeze_pending = true;
        self.backend.request_quiesce(task);
    }

    fn thaw_task(&self, inner: &mut LegacyInner, task: TaskId) {
        let Some(state) = inner.tasks.get_mut(&task) else {
            return;
        };
        if state.exempt || !(state.freeze_pending || state.frozen) {
            return;
        }
        state.freeze_pending = false;
        state.frozen = false;
        self.backend.request_resume(task);
    }

    /// The collaborator reports that `task` reached its quiesced state.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownTask`] for an unregistered task.
    pub fn task_quiesced(&self, task: TaskId) -> FreezerResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .tasks
            .get_mut(&task)
            .ok_or(FreezerError::UnknownTask { task })?;
        if state.frozen || !state.freeze_pending {
            return Ok(());
        }
        state.frozen = true;
        let group = state.group;
        self.update_frozen(&mut inner, group);
        Ok(())
    }

    /// Forget an exited task.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownTask`] for an unregistered task.
    pub fn task_exited(&self, task: TaskId) -> FreezerResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .tasks
            .remove(&task)
            .ok_or(FreezerError::UnknownTask { task })?;
        self.update_frozen(&mut inner, state.group);
        Ok(())
    }

    /// Re-derive a group's frozen flag from its own tasks.
    fn update_frozen(&self, inner: &mut LegacyInner, group: GroupId) {
        let Some(state) = inner.groups.get(&group) else {
            return;
        };
        let frozen = state.freezing()
            && self
                .hierarchy
                .tasks_of(group)
                .iter()
                .filter_map(|t| inner.tasks.get(t))
                .all(|t| t.exempt || t.frozen);
        if let Some(state) = inner.groups.get_mut(&group) {
            if state.frozen != frozen {
                tracing::debug!(%group, frozen, "legacy group frozen flag");
                state.frozen = frozen;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::{QuiesceAction, RecordingBackend};
    use crate::hierarchy::MemoryHierarchy;

    fn g(n: u64) -> GroupId {
        GroupId(n)
    }

    fn t(n: u64) -> TaskId {
        TaskId(n)
    }

    type TestLegacy = LegacyFreezer<Arc<MemoryHierarchy>, Arc<RecordingBackend>>;

    fn legacy() -> (Arc<MemoryHierarchy>, Arc<RecordingBackend>, TestLegacy) {
        let tree = Arc::new(MemoryHierarchy::new());
        let backend = Arc::new(RecordingBackend::new());
        let freezer = LegacyFreezer::new(Arc::clone(&tree), Arc::clone(&backend));
        (tree, backend, freezer)
    }

    #[test]
    fn test_self_and_parent_causes_are_distinct() {
        let (tree, _backend, freezer) = legacy();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        freezer.group_added(g(1)).unwrap();
        freezer.group_added(g(2)).unwrap();

        freezer.set_freeze(g(1), true).unwrap();

        let root = freezer.state(g(1)).unwrap();
        assert!(root.freezing_self && !root.freezing_parent);
        let child = freezer.state(g(2)).unwrap();
        assert!(!child.freezing_self && child.freezing_parent);
    }

    #[test]
    fn test_freezing_counter_tracks_union_transitions() {
        let (tree, _backend, freezer) = legacy();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        freezer.group_added(g(1)).unwrap();
        freezer.group_added(g(2)).unwrap();
        assert!(!freezer.any_freezing());

        freezer.set_freeze(g(1), true).unwrap();
        assert_eq!(freezer.freezing_group_count(), 2);

        // A second cause on an already freezing group does not re-count.
        freezer.set_freeze(g(2), true).unwrap();
        assert_eq!(freezer.freezing_group_count(), 2);

        freezer.set_freeze(g(1), false).unwrap();
        assert_eq!(freezer.freezing_group_count(), 1, "child keeps its own cause");

        freezer.set_freeze(g(2), false).unwrap();
        assert_eq!(freezer.freezing_group_count(), 0);
        assert!(!freezer.any_freezing());
    }

    #[test]
    fn test_ancestor_thaw_keeps_self_requested_descendant() {
        let (tree, backend, freezer) = legacy();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        tree.add_child(g(2), g(3));
        for id in [g(1), g(2), g(3)] {
            freezer.group_added(id).unwrap();
        }
        tree.add_task(t(10), g(3), false);
        freezer.task_attached(t(10), g(3), false).unwrap();

        freezer.set_freeze(g(1), true).unwrap();
        freezer.set_freeze(g(2), true).unwrap();
        freezer.task_quiesced(t(10)).unwrap();
        backend.take();

        freezer.set_freeze(g(1), false).unwrap();

        let mid = freezer.state(g(2)).unwrap();
        assert!(mid.freezing_self && !mid.freezing_parent);
        let leaf = freezer.state(g(3)).unwrap();
        assert!(leaf.freezing_parent, "re-derived from the still freezing parent");
        assert!(freezer.state(g(3)).unwrap().frozen);
        assert!(backend.take().is_empty(), "no task was thawed");
    }

    #[test]
    fn test_thaw_affects_only_walked_groups() {
        let (tree, backend, freezer) = legacy();
        tree.add_root(g(1));
        tree.add_root(g(2));
        freezer.group_added(g(1)).unwrap();
        freezer.group_added(g(2)).unwrap();
        tree.add_task(t(10), g(1), false);
        tree.add_task(t(11), g(2), false);
        freezer.task_attached(t(10), g(1), false).unwrap();
        freezer.task_attached(t(11), g(2), false).unwrap();
        freezer.set_freeze(g(1), true).unwrap();
        freezer.set_freeze(g(2), true).unwrap();
        backend.take();

        freezer.set_freeze(g(1), false).unwrap();

        assert_eq!(backend.take(), vec![QuiesceAction::Resume(t(10))]);
        assert!(freezer.state(g(2)).unwrap().freezing_self);
    }

    #[test]
    fn test_fork_during_freeze_is_enforced() {
        // The forked child can never run unfrozen inside the subtree.
        let (tree, backend, freezer) = legacy();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        freezer.group_added(g(1)).unwrap();
        freezer.group_added(g(2)).unwrap();
        freezer.set_freeze(g(1), true).unwrap();
        backend.take();

        tree.add_task(t(10), g(2), false);
        freezer.task_forked(t(10), g(2), false).unwrap();

        assert_eq!(backend.take(), vec![QuiesceAction::Quiesce(t(10))]);
        freezer.task_quiesced(t(10)).unwrap();
        assert!(freezer.state(g(2)).unwrap().frozen);
    }

    #[test]
    fn test_fork_intent_reaches_group_the_walk_missed() {
        // The child's group came online before it was linked under the
        // frozen root, so it carries no freezing cause; the recorded
        // intent on the subtree root still freezes the fork.
        let (tree, backend, freezer) = legacy();
        tree.add_root(g(1));
        freezer.group_added(g(1)).unwrap();
        freezer.set_freeze(g(1), true).unwrap();
        backend.take();

        freezer.group_added(g(2)).unwrap();
        tree.add_child(g(1), g(2));
        tree.add_task(t(10), g(2), false);
        freezer.task_forked(t(10), g(2), false).unwrap();

        assert!(!freezer.state(g(2)).unwrap().freezing());
        assert_eq!(backend.take(), vec![QuiesceAction::Quiesce(t(10))]);
    }

    #[test]
    fn test_exempt_task_skipped() {
        let (tree, backend, freezer) = legacy();
        tree.add_root(g(1));
        freezer.group_added(g(1)).unwrap();
        tree.add_task(t(10), g(1), true);
        freezer.task_attached(t(10), g(1), true).unwrap();

        freezer.set_freeze(g(1), true).unwrap();

        assert!(backend.take().is_empty());
        assert!(
            freezer.state(g(1)).unwrap().frozen,
            "exempt task does not block the frozen flag"
        );
    }

    #[test]
    fn test_offline_group_ignored_by_walks() {
        let (tree, backend, freezer) = legacy();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        freezer.group_added(g(1)).unwrap();
        // g(2) exists in the tree but never came online here.

        freezer.set_freeze(g(1), true).unwrap();

        assert!(freezer.state(g(2)).is_err());
        assert_eq!(freezer.freezing_group_count(), 1);
        assert!(backend.take().is_empty());
    }

    #[test]
    fn test_group_added_under_freezing_parent_counts() {
        let (tree, _backend, freezer) = legacy();
        tree.add_root(g(1));
        freezer.group_added(g(1)).unwrap();
        freezer.set_freeze(g(1), true).unwrap();

        tree.add_child(g(1), g(2));
        freezer.group_added(g(2)).unwrap();

        assert!(freezer.state(g(2)).unwrap().freezing_parent);
        assert_eq!(freezer.freezing_group_count(), 2);

        freezer.group_removed(g(2)).unwrap();
        assert_eq!(freezer.freezing_group_count(), 1);
    }

    #[test]
    fn test_legacy_state_serde_roundtrip() {
        let state = LegacyState {
            online: true,
            freezing_self: true,
            freezing_parent: false,
            frozen: false,
        };
        let json = serde_json::to_string(&state).unwrap();
        let restored: LegacyState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, restored);
    }
}
