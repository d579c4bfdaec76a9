//! Group and task identifiers and the group-tree collaborator.
//!
//! The freezer does not own the process-group tree. Tree shape (parent
//! links, live descendants, task membership) is consumed through the
//! [`GroupHierarchy`] trait so the freezer can never diverge from the
//! tree's source of truth; it deliberately keeps no cached child lists.
//!
//! [`MemoryHierarchy`] is an in-crate implementation for embedders that do
//! not already have a tree, and for tests.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Identifier for a process group (one node in the tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Identifier for a process (task) owned by exactly one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Read access to the externally owned process-group tree.
///
/// Implementations must reflect live membership at call time and must not
/// block: these methods are called while the freezer's bookkeeping lock is
/// held.
///
/// # Contract
///
/// - `descendants_preorder` yields the subtree rooted at `group` in
///   pre-order, `group` itself first, parents always before their children.
/// - `descendant_count` is the transitive number of descendant groups, not
///   including `group` itself.
/// - `task_count` counts live, non-exempt tasks directly owned by `group`.
///   Exempt tasks are never frozen and must not appear in the denominator
///   used to decide freeze completion.
/// - `tasks_of` enumerates all directly owned tasks, exempt included; the
///   per-task driver skips exempt tasks itself.
pub trait GroupHierarchy: Send + Sync {
    /// Parent of `group`, or `None` for a root or unknown group.
    fn parent(&self, group: GroupId) -> Option<GroupId>;

    /// Pre-order subtree of `group`, including `group` itself first.
    fn descendants_preorder(&self, group: GroupId) -> Vec<GroupId>;

    /// Transitive number of descendant groups, excluding `group`.
    fn descendant_count(&self, group: GroupId) -> u64;

    /// Number of live, non-exempt tasks directly owned by `group`.
    fn task_count(&self, group: GroupId) -> u64;

    /// All tasks directly owned by `group`, exempt included.
    fn tasks_of(&self, group: GroupId) -> Vec<TaskId>;

    /// Whether `group` exists and has not been removed or marked dead.
    fn is_live(&self, group: GroupId) -> bool;
}

#[derive(Debug)]
struct GroupNode {
    parent: Option<GroupId>,
    children: Vec<GroupId>,
    tasks: Vec<TaskId>,
    live: bool,
}

#[derive(Debug, Clone, Copy)]
struct TaskMeta {
    group: GroupId,
    exempt: bool,
}

#[derive(Debug, Default)]
struct TreeInner {
    groups: HashMap<GroupId, GroupNode>,
    tasks: HashMap<TaskId, TaskMeta>,
}

/// An in-memory process-group tree.
///
/// Interior-mutable so it can be shared (via `Arc`) between the embedder,
/// which edits membership, and the freezer, which only reads it. Mutations
/// are simple membership edits; freeze bookkeeping stays in the freezer.
#[derive(Debug, Default)]
pub struct MemoryHierarchy {
    inner: RwLock<TreeInner>,
}

impl MemoryHierarchy {
    /// Create an empty hierarchy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root group.
    ///
    /// Silently replaces nothing: adding an existing id is ignored so test
    /// setup stays infallible; the freezer's own registration is the place
    /// where duplicates are rejected.
    pub fn add_root(&self, group: GroupId) {
        let mut inner = self.inner.write();
        inner.groups.entry(group).or_insert(GroupNode {
            parent: None,
            children: Vec::new(),
            tasks: Vec::new(),
            live: true,
        });
    }

    /// Add `group` as the last child of `parent`.
    pub fn add_child(&self, parent: GroupId, group: GroupId) {
        let mut inner = self.inner.write();
        if inner.groups.contains_key(&group) {
            return;
        }
        inner.groups.insert(
            group,
            GroupNode {
                parent: Some(parent),
                children: Vec::new(),
                tasks: Vec::new(),
                live: true,
            },
        );
        if let Some(p) = inner.groups.get_mut(&parent) {
            p.children.push(group);
        }
    }

    /// Mark a group dead without unlinking it, as removal paths do while a
    /// walk may still be in flight. Dead groups are skipped by traversals.
    pub fn mark_dead(&self, group: GroupId) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.groups.get_mut(&group) {
            node.live = false;
        }
    }

    /// Remove an empty leaf group from the tree.
    pub fn remove_group(&self, group: GroupId) {
        let mut inner = self.inner.write();
        let Some(node) = inner.groups.get(&group) else {
            return;
        };
        debug_assert!(node.children.is_empty(), "removing non-leaf {group}");
        debug_assert!(node.tasks.is_empty(), "removing non-empty {group}");
        let parent = node.parent;
        inner.groups.remove(&group);
        if let Some(p) = parent.and_then(|p| inner.groups.get_mut(&p)) {
            p.children.retain(|c| *c != group);
        }
    }

    /// Attach a task to a group.
    pub fn add_task(&self, task: TaskId, group: GroupId, exempt: bool) {
        let mut inner = self.inner.write();
        inner.tasks.insert(task, TaskMeta { group, exempt });
        if let Some(node) = inner.groups.get_mut(&group) {
            node.tasks.push(task);
        }
    }

    /// Detach an exited task from its group.
    pub fn remove_task(&self, task: TaskId) {
        let mut inner = self.inner.write();
        let Some(meta) = inner.tasks.remove(&task) else {
            return;
        };
        if let Some(node) = inner.groups.get_mut(&meta.group) {
            node.tasks.retain(|t| *t != task);
        }
    }

    /// Move a task to a different group.
    pub fn move_task(&self, task: TaskId, dst: GroupId) {
        let mut inner = self.inner.write();
        let Some(meta) = inner.tasks.get(&task).copied() else {
            return;
        };
        if let Some(node) = inner.groups.get_mut(&meta.group) {
            node.tasks.retain(|t| *t != task);
        }
        if let Some(node) = inner.groups.get_mut(&dst) {
            node.tasks.push(task);
        }
        if let Some(meta) = inner.tasks.get_mut(&task) {
            meta.group = dst;
        }
    }
}

impl GroupHierarchy for MemoryHierarchy {
    fn parent(&self, group: GroupId) -> Option<GroupId> {
        self.inner.read().groups.get(&group).and_then(|n| n.parent)
    }

    fn descendants_preorder(&self, group: GroupId) -> Vec<GroupId> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut stack = vec![group];
        while let Some(id) = stack.pop() {
            let Some(node) = inner.groups.get(&id) else {
                continue;
            };
            out.push(id);
            // Reverse so children are visited in insertion order.
            for child in node.children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    fn descendant_count(&self, group: GroupId) -> u64 {
        let inner = self.inner.read();
        let mut count = 0_u64;
        let mut stack: Vec<GroupId> = inner
            .groups
            .get(&group)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            let Some(node) = inner.groups.get(&id) else {
                continue;
            };
            count += 1;
            stack.extend(node.children.iter().copied());
        }
        count
    }

    fn task_count(&self, group: GroupId) -> u64 {
        let inner = self.inner.read();
        let Some(node) = inner.groups.get(&group) else {
            return 0;
        };
        node.tasks
            .iter()
            .filter(|t| inner.tasks.get(t).is_some_and(|m| !m.exempt))
            .count() as u64
    }

    fn tasks_of(&self, group: GroupId) -> Vec<TaskId> {
        self.inner
            .read()
            .groups
            .get(&group)
            .map(|n| n.tasks.clone())
            .unwrap_or_default()
    }

    fn is_live(&self, group: GroupId) -> bool {
        self.inner.read().groups.get(&group).is_some_and(|n| n.live)
    }
}

impl<H: GroupHierarchy + ?Sized> GroupHierarchy for std::sync::Arc<H> {
    fn parent(&self, group: GroupId) -> Option<GroupId> {
        (**self).parent(group)
    }

    fn descendants_preorder(&self, group: GroupId) -> Vec<GroupId> {
        (**self).descendants_preorder(group)
    }

    fn descendant_count(&self, group: GroupId) -> u64 {
        (**self).descendant_count(group)
    }

    fn task_count(&self, group: GroupId) -> u64 {
        (**self).task_count(group)
    }

    fn tasks_of(&self, group: GroupId) -> Vec<TaskId> {
        (**self).tasks_of(group)
    }

    fn is_live(&self, group: GroupId) -> bool {
        (**self).is_live(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(n: u64) -> GroupId {
        GroupId(n)
    }

    fn t(n: u64) -> TaskId {
        TaskId(n)
    }

    #[test]
    fn test_preorder_parent_before_children() {
        let tree = MemoryHierarchy::new();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        tree.add_child(g(1), g(3));
        tree.add_child(g(2), g(4));

        let order = tree.descendants_preorder(g(1));
        assert_eq!(order, vec![g(1), g(2), g(4), g(3)]);
    }

    #[test]
    fn test_descendant_count_is_transitive() {
        let tree = MemoryHierarchy::new();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        tree.add_child(g(2), g(3));
        tree.add_child(g(2), g(4));

        assert_eq!(tree.descendant_count(g(1)), 3);
        assert_eq!(tree.descendant_count(g(2)), 2);
        assert_eq!(tree.descendant_count(g(3)), 0);
    }

    #[test]
    fn test_task_count_excludes_exempt() {
        let tree = MemoryHierarchy::new();
        tree.add_root(g(1));
        tree.add_task(t(10), g(1), false);
        tree.add_task(t(11), g(1), true);

        assert_eq!(tree.task_count(g(1)), 1);
        assert_eq!(tree.tasks_of(g(1)), vec![t(10), t(11)]);
    }

    #[test]
    fn test_move_task_updates_both_groups() {
        let tree = MemoryHierarchy::new();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        tree.add_task(t(10), g(1), false);
        tree.move_task(t(10), g(2));

        assert_eq!(tree.task_count(g(1)), 0);
        assert_eq!(tree.task_count(g(2)), 1);
    }

    #[test]
    fn test_dead_group_not_live_but_still_linked() {
        let tree = MemoryHierarchy::new();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        tree.mark_dead(g(2));

        assert!(!tree.is_live(g(2)));
        assert!(tree.is_live(g(1)));
        // Still enumerated; the freezer skips dead groups itself.
        assert_eq!(tree.descendants_preorder(g(1)), vec![g(1), g(2)]);
    }

    #[test]
    fn test_remove_group_unlinks_from_parent() {
        let tree = MemoryHierarchy::new();
        tree.add_root(g(1));
        tree.add_child(g(1), g(2));
        tree.remove_group(g(2));

        assert_eq!(tree.descendant_count(g(1)), 0);
        assert!(!tree.is_live(g(2)));
    }
}
