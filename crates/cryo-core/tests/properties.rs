//! Property tests over randomly shaped trees and request sequences:
//! convergence of a root freeze, the depth bookkeeping staying in lockstep
//! with active requests, and idempotence of repeated requests.

use std::sync::Arc;

use proptest::prelude::*;

use cryo_core::{
    Freezer, FreezerConfig, GroupId, MemoryHierarchy, QuiesceAction, RecordingBackend, TaskId,
};

type TestFreezer = Freezer<Arc<MemoryHierarchy>, Arc<RecordingBackend>>;

/// Tree shape as a parent table: node 0 is the root and node `i` hangs off
/// `parents[i - 1]`, which is always an earlier node. Tasks are group
/// indices.
#[derive(Debug, Clone)]
struct TreeShape {
    parents: Vec<usize>,
    task_groups: Vec<usize>,
}

fn tree_shape() -> impl Strategy<Value = TreeShape> {
    (2usize..10)
        .prop_flat_map(|n| {
            (
                prop::collection::vec(any::<prop::sample::Index>(), n - 1),
                prop::collection::vec(0..n, 0..16),
            )
        })
        .prop_map(|(parent_picks, task_groups)| TreeShape {
            parents: parent_picks
                .into_iter()
                .enumerate()
                .map(|(i, pick)| pick.index(i + 1))
                .collect(),
            task_groups,
        })
}

fn build(shape: &TreeShape) -> (Arc<MemoryHierarchy>, Arc<RecordingBackend>, TestFreezer) {
    let tree = Arc::new(MemoryHierarchy::new());
    let backend = Arc::new(RecordingBackend::new());
    let freezer = Freezer::new(
        FreezerConfig::default(),
        Arc::clone(&tree),
        Arc::clone(&backend),
    )
    .expect("default config is valid");

    tree.add_root(GroupId(0));
    freezer.group_added(GroupId(0)).expect("fresh id");
    for (i, parent) in shape.parents.iter().enumerate() {
        let id = GroupId(i as u64 + 1);
        tree.add_child(GroupId(*parent as u64), id);
        freezer.group_added(id).expect("fresh id");
    }
    for (i, group) in shape.task_groups.iter().enumerate() {
        let task = TaskId(1000 + i as u64);
        tree.add_task(task, GroupId(*group as u64), false);
        freezer
            .task_attached(task, GroupId(*group as u64), false)
            .expect("fresh id");
    }
    (tree, backend, freezer)
}

fn quiesce_all(freezer: &TestFreezer, backend: &RecordingBackend) {
    loop {
        let actions = backend.take();
        if actions.is_empty() {
            return;
        }
        for action in actions {
            if let QuiesceAction::Quiesce(task) = action {
                freezer.task_quiesced(task).expect("task is registered");
            }
        }
    }
}

fn group_count(shape: &TreeShape) -> usize {
    shape.parents.len() + 1
}

proptest! {
    /// Once every stop request is acknowledged, a root freeze leaves the
    /// whole tree frozen with exact counters, and a root thaw undoes all
    /// of it.
    #[test]
    fn prop_root_freeze_converges(shape in tree_shape()) {
        let (_tree, backend, freezer) = build(&shape);

        freezer.set_freeze(GroupId(0), true).unwrap();
        quiesce_all(&freezer, &backend);

        for i in 0..group_count(&shape) {
            let status = freezer.status(GroupId(i as u64)).unwrap();
            prop_assert!(status.frozen, "group {i} did not finish");
            let own = shape.task_groups.iter().filter(|g| **g == i).count();
            prop_assert_eq!(status.frozen_task_count, own as u64);
        }
        for i in 0..shape.task_groups.len() {
            prop_assert!(freezer.task_frozen(TaskId(1000 + i as u64)).unwrap());
        }

        freezer.set_freeze(GroupId(0), false).unwrap();
        for i in 0..group_count(&shape) {
            let status = freezer.status(GroupId(i as u64)).unwrap();
            prop_assert!(!status.frozen);
            prop_assert_eq!(status.frozen_task_count, 0);
            prop_assert_eq!(status.frozen_descendant_count, 0);
        }
        for i in 0..shape.task_groups.len() {
            prop_assert!(!freezer.task_frozen(TaskId(1000 + i as u64)).unwrap());
        }
    }

    /// Under any sequence of freeze/thaw toggles on random groups, every
    /// group's depth equals the number of requests covering it and never
    /// goes negative.
    #[test]
    fn prop_depth_matches_covering_requests(
        shape in tree_shape(),
        toggles in prop::collection::vec(any::<prop::sample::Index>(), 1..24),
    ) {
        let (_tree, _backend, freezer) = build(&shape);
        let n = group_count(&shape);
        let mut requested = vec![false; n];

        for index in toggles {
            let target = index.index(n);
            requested[target] = !requested[target];
            freezer
                .set_freeze(GroupId(target as u64), requested[target])
                .unwrap();

            for i in 0..n {
                // Requests covering group i: those on i itself or any
                // ancestor.
                let mut covering = u64::from(requested[i]);
                let mut cursor = i;
                while cursor != 0 {
                    cursor = shape.parents[cursor - 1];
                    covering += u64::from(requested[cursor]);
                }
                let status = freezer.status(GroupId(i as u64)).unwrap();
                prop_assert!(status.nested_freeze_depth >= 0);
                prop_assert_eq!(status.nested_freeze_depth, covering as i64);
                prop_assert_eq!(status.freeze_requested, covering > 0);
            }
        }
    }

    /// Repeating a request is a no-op: no second round of task actions
    /// and no state change.
    #[test]
    fn prop_repeated_request_is_idempotent(shape in tree_shape(), freeze in any::<bool>()) {
        let (_tree, backend, freezer) = build(&shape);

        if freeze {
            freezer.set_freeze(GroupId(0), true).unwrap();
            quiesce_all(&freezer, &backend);
        }
        let before: Vec<_> = (0..group_count(&shape))
            .map(|i| freezer.status(GroupId(i as u64)).unwrap())
            .collect();

        freezer.set_freeze(GroupId(0), freeze).unwrap();

        prop_assert!(backend.take().is_empty());
        for (i, expected) in before.iter().enumerate() {
            let status = freezer.status(GroupId(i as u64)).unwrap();
            prop_assert_eq!(&status, expected);
        }
    }
}
