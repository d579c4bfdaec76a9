//! The administrative facade: freeze requests, task lifecycle hooks, and
//! migration, all sharing one bookkeeping lock.
//!
//! # Architecture
//!
//! [`Freezer`] sits between three collaborators:
//!
//! ```text
//! administrative tooling          process-scheduling collaborator
//!        |                                    ^      |
//!        v                                    |      v
//!   set_freeze ----> per-task driver ---------+   task_quiesced /
//!        |            (request quiesce/resume)    task_exited / ...
//!        v                                            |
//!   group walk  <---- GroupHierarchy (tree shape)     |
//!        |                                            v
//!        +----> counters ----> upward propagation ----+--> event stream
//! ```
//!
//! A freeze request walks the subtree top-down in pre-order, recording the
//! obligation depth on every live descendant and issuing task actions only
//! where the effective obligation actually transitions 0<->1. Completion
//! flows back bottom-up: each task reaching its stop point bumps its
//! group's frozen count, and the propagation pass folds finished groups
//! into their ancestors' frozen descendant counts.
//!
//! # Locking
//!
//! `set_freeze` holds the request-serialization lock for the whole walk so
//! two administrative requests can never interleave their descendant
//! walks, and takes the bookkeeping lock once per visited group. The task
//! hooks and migration take only the bookkeeping lock; they are safe from
//! exit paths that must not sleep.

use parking_lot::Mutex;

use crate::config::FreezerConfig;
use crate::driver::{self, QuiesceBackend};
use crate::error::{FreezerError, FreezerResult};
use crate::events::{EventSink, FreezeEvent};
use crate::hierarchy::{GroupHierarchy, GroupId, TaskId};
use crate::propagate::{forget_frozen_descendant, recompute};
use crate::state::{Bookkeeping, GroupFreezeState, GroupStatus, TaskFreezeState};

/// Hierarchical freeze/thaw controller for one process-group tree.
pub struct Freezer<H, B> {
    config: FreezerConfig,
    hierarchy: H,
    backend: B,
    book: Mutex<Bookkeeping>,
    admin: Mutex<()>,
    events: EventSink,
}

impl<H: GroupHierarchy, B: QuiesceBackend> Freezer<H, B> {
    /// Create a freezer over an externally owned tree and stop/resume
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::InvalidConfig`] if the configuration is out
    /// of bounds.
    pub fn new(config: FreezerConfig, hierarchy: H, backend: B) -> FreezerResult<Self> {
        config.validate()?;
        let events = EventSink::with_capacity(config.event_capacity);
        Ok(Self {
            config,
            hierarchy,
            backend,
            book: Mutex::new(Bookkeeping::default()),
            admin: Mutex::new(()),
            events,
        })
    }

    /// A receiver for the status-change event stream.
    #[must_use]
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<FreezeEvent> {
        self.events.subscribe()
    }

    /// Number of status events dropped to channel overflow so far.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Freeze or thaw the subtree rooted at `group`.
    ///
    /// Idempotent and asynchronous: the call records intent and issues
    /// per-task stop/resume requests; completion is observed via
    /// [`Freezer::is_frozen`] or the event stream. A group that cannot
    /// finish (a task that never stops) simply stays not-frozen; there is
    /// no timeout and no retry.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownGroup`] or [`FreezerError::DeadGroup`]
    /// when `group` is not a live registered group.
    pub fn set_freeze(&self, group: GroupId, freeze: bool) -> FreezerResult<()> {
        let _admin = self.admin.lock();

        {
            let mut book = self.book.lock();
            let state = book
                .groups
                .get_mut(&group)
                .ok_or(FreezerError::UnknownGroup { group })?;
            if !self.hierarchy.is_live(group) {
                return Err(FreezerError::DeadGroup { group });
            }
            if state.self_freeze == freeze {
                return Ok(());
            }
            state.self_freeze = freeze;
        }
        tracing::debug!(%group, freeze, "administrative freeze request");

        let mut applied = false;
        for descendant in self.hierarchy.descendants_preorder(group) {
            if !self.hierarchy.is_live(descendant) {
                continue;
            }
            let mut book = self.book.lock();
            // Removed mid-walk: its accounting was handled by the removal
            // path.
            let Some(state) = book.groups.get_mut(&descendant) else {
                continue;
            };
            if freeze {
                state.nested_freeze_depth += 1;
                // Already obligated by another ancestor's request.
                if state.nested_freeze_depth > 1 {
                    continue;
                }
            } else {
                state.nested_freeze_depth -= 1;
                assert!(
                    state.nested_freeze_depth >= 0,
                    "nested freeze depth underflow for {descendant}: {state:?}"
                );
                // Still obligated by another ancestor's request.
                if state.nested_freeze_depth > 0 {
                    continue;
                }
            }
            self.apply_group_freeze(&mut book, descendant, freeze);
            applied = true;
        }

        if !applied {
            // The state is enforced by an ancestor: the subtree can already
            // be in the desired state, or locked in the opposite one. Tell
            // the observer there is nothing to wait for.
            let book = self.book.lock();
            if let Some(state) = book.groups.get(&group) {
                self.events.emit(group, state.frozen);
            }
        }
        Ok(())
    }

    /// Change one group's effective state and act on its tasks.
    fn apply_group_freeze(&self, book: &mut Bookkeeping, group: GroupId, freeze: bool) {
        tracing::debug!(%group, freeze, "effective freeze transition");
        if let Some(state) = book.groups.get_mut(&group) {
            state.freeze_requested = freeze;
        }

        for task in self.hierarchy.tasks_of(group) {
            driver::set_task_freeze(book, &self.hierarchy, &self.events, &self.backend, task, freeze);
        }

        // Revisit eagerly to cover empty leaves and groups whose
        // descendants already reached the desired state.
        let descendants_settled = book
            .groups
            .get(&group)
            .is_some_and(|s| s.frozen_descendant_count == self.hierarchy.descendant_count(group));
        if descendants_settled {
            recompute(book, &self.hierarchy, &self.events, group);
        }
    }

    /// Point-in-time aggregate frozen status of `group`.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownGroup`] for an unregistered group.
    pub fn is_frozen(&self, group: GroupId) -> FreezerResult<bool> {
        let book = self.book.lock();
        book.groups
            .get(&group)
            .map(|s| s.frozen)
            .ok_or(FreezerError::UnknownGroup { group })
    }

    /// Full status snapshot of `group`. May be stale by the time the
    /// caller acts on it.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownGroup`] for an unregistered group.
    pub fn status(&self, group: GroupId) -> FreezerResult<GroupStatus> {
        let book = self.book.lock();
        let state = book
            .groups
            .get(&group)
            .ok_or(FreezerError::UnknownGroup { group })?;
        Ok(GroupStatus {
            group,
            self_freeze: state.self_freeze,
            freeze_requested: state.freeze_requested,
            frozen: state.frozen,
            nested_freeze_depth: state.nested_freeze_depth,
            frozen_task_count: state.frozen_task_count,
            frozen_descendant_count: state.frozen_descendant_count,
        })
    }

    /// Whether `task` has reached the quiesced state.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownTask`] for an unregistered task.
    pub fn task_frozen(&self, task: TaskId) -> FreezerResult<bool> {
        let book = self.book.lock();
        book.tasks
            .get(&task)
            .map(|s| s.frozen)
            .ok_or(FreezerError::UnknownTask { task })
    }

    /// Register a newly created group, after the tree collaborator has
    /// linked it. The group inherits its parent's effective obligation, so
    /// a group created inside a frozen subtree starts obligated.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::GroupAlreadyRegistered`] on a duplicate id
    /// and [`FreezerError::GroupLimitExceeded`] at the configured bound.
    pub fn group_added(&self, group: GroupId) -> FreezerResult<()> {
        let mut book = self.book.lock();
        if book.groups.contains_key(&group) {
            return Err(FreezerError::GroupAlreadyRegistered { group });
        }
        if book.groups.len() >= self.config.max_groups {
            return Err(FreezerError::GroupLimitExceeded {
                max: self.config.max_groups,
            });
        }
        let parent = self.hierarchy.parent(group);
        let state = match parent.and_then(|p| book.groups.get(&p)) {
            Some(parent_state) => GroupFreezeState::child_of(parent_state),
            None => GroupFreezeState::default(),
        };
        book.groups.insert(group, state);

        // An empty obligated group is frozen immediately; an unobligated
        // one grew its parent's denominator instead.
        recompute(&mut book, &self.hierarchy, &self.events, group);
        if let Some(parent) = parent {
            recompute(&mut book, &self.hierarchy, &self.events, parent);
        }
        Ok(())
    }

    /// Forget a removed group, after the tree collaborator has unlinked
    /// it. `parent` is the group's old parent, which the hierarchy no
    /// longer remembers.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownGroup`] for an unregistered group and
    /// [`FreezerError::GroupNotEmpty`] if the tree still shows descendants
    /// or tasks for it.
    pub fn group_removed(&self, group: GroupId, parent: Option<GroupId>) -> FreezerResult<()> {
        let mut book = self.book.lock();
        if self.hierarchy.descendant_count(group) != 0 || self.hierarchy.task_count(group) != 0 {
            return Err(FreezerError::GroupNotEmpty { group });
        }
        let state = book
            .groups
            .remove(&group)
            .ok_or(FreezerError::UnknownGroup { group })?;

        if let Some(parent) = parent {
            if state.frozen {
                forget_frozen_descendant(&mut book, &self.hierarchy, group, parent);
            }
            // The parent may have just lost its last unfrozen descendant.
            recompute(&mut book, &self.hierarchy, &self.events, parent);
        }
        Ok(())
    }

    /// Register a task that appeared in `group` (fork or first attach),
    /// after the tree collaborator has recorded it. A task arriving in an
    /// obligated group is frozen immediately, so a forked child can never
    /// run unfrozen inside a frozen subtree.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::TaskAlreadyRegistered`] on a duplicate id
    /// and [`FreezerError::UnknownGroup`] if `group` is not registered.
    pub fn task_attached(&self, task: TaskId, group: GroupId, exempt: bool) -> FreezerResult<()> {
        let mut book = self.book.lock();
        if book.tasks.contains_key(&task) {
            return Err(FreezerError::TaskAlreadyRegistered { task });
        }
        let obligated = book
            .groups
            .get(&group)
            .ok_or(FreezerError::UnknownGroup { group })?
            .freeze_requested;
        book.tasks.insert(task, TaskFreezeState::new(group, exempt));

        if obligated && !exempt {
            driver::set_task_freeze(&mut book, &self.hierarchy, &self.events, &self.backend, task, true);
        }
        // A new non-exempt task grows the completion denominator; a frozen
        // group goes back to waiting until the newcomer stops.
        recompute(&mut book, &self.hierarchy, &self.events, group);
        Ok(())
    }

    /// The process-scheduling collaborator reports that `task` reached its
    /// quiesced state. Idempotent; a report racing a thaw is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownTask`] for an unregistered task.
    pub fn task_quiesced(&self, task: TaskId) -> FreezerResult<()> {
        let mut book = self.book.lock();
        let state = book
            .tasks
            .get_mut(&task)
            .ok_or(FreezerError::UnknownTask { task })?;
        if state.frozen || !state.freeze_pending {
            return Ok(());
        }
        state.frozen = true;
        let group = state.owning_group;
        tracing::trace!(%task, %group, "task quiesced");
        if let Some(group_state) = book.groups.get_mut(&group) {
            group_state.inc_frozen_tasks();
        }
        recompute(&mut book, &self.hierarchy, &self.events, group);
        Ok(())
    }

    /// The task woke for an unrelated reason while frozen. If the freeze
    /// obligation still stands, its frozen accounting is retained and the
    /// stop request re-asserted, so it can never leak back to useful work;
    /// otherwise it leaves the frozen state normally.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownTask`] for an unregistered task.
    pub fn task_spurious_wake(&self, task: TaskId) -> FreezerResult<()> {
        let mut book = self.book.lock();
        let state = book
            .tasks
            .get(&task)
            .ok_or(FreezerError::UnknownTask { task })?;
        if !state.frozen {
            return Ok(());
        }
        let group = state.owning_group;
        let obligated = book
            .groups
            .get(&group)
            .is_some_and(|g| g.freeze_requested);

        if obligated {
            tracing::trace!(%task, "spurious wake while obligated, re-asserting stop");
            self.backend.request_quiesce(task);
        } else {
            let state = book.tasks.get_mut(&task).expect("task present above");
            state.frozen = false;
            state.freeze_pending = false;
            if let Some(group_state) = book.groups.get_mut(&group) {
                group_state.dec_frozen_tasks(group);
            }
            recompute(&mut book, &self.hierarchy, &self.events, group);
        }
        Ok(())
    }

    /// Forget an exited task, after the tree collaborator has dropped it.
    /// A task dying while frozen gives its count back exactly as a thaw
    /// would.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownTask`] for an unregistered task.
    pub fn task_exited(&self, task: TaskId) -> FreezerResult<()> {
        let mut book = self.book.lock();
        let state = book
            .tasks
            .remove(&task)
            .ok_or(FreezerError::UnknownTask { task })?;
        let group = state.owning_group;
        if state.frozen {
            if let Some(group_state) = book.groups.get_mut(&group) {
                group_state.dec_frozen_tasks(group);
            }
        }
        // The denominator shrank either way; the group may now be complete.
        recompute(&mut book, &self.hierarchy, &self.events, group);
        Ok(())
    }

    /// Rebalance counters for a task that moved from `src` to `dst`, after
    /// the tree collaborator has moved it. A frozen task stays frozen
    /// across the move; it is then forced to match `dst`'s effective
    /// state, all inside one bookkeeping critical section so counters can
    /// never be observed mid-flight.
    ///
    /// Exempt tasks are not migrated through this path; the call is a
    /// no-op for them.
    ///
    /// # Errors
    ///
    /// Returns [`FreezerError::UnknownTask`] for an unregistered task and
    /// [`FreezerError::UnknownGroup`] if `dst` is not registered.
    pub fn migrate(&self, task: TaskId, src: GroupId, dst: GroupId) -> FreezerResult<()> {
        let mut book = self.book.lock();
        if !book.groups.contains_key(&dst) {
            return Err(FreezerError::UnknownGroup { group: dst });
        }
        let state = book
            .tasks
            .get_mut(&task)
            .ok_or(FreezerError::UnknownTask { task })?;
        if state.exempt {
            return Ok(());
        }
        debug_assert_eq!(state.owning_group, src, "migration source mismatch for {task}");
        state.owning_group = dst;
        let frozen = state.frozen;
        let pending = state.freeze_pending;
        tracing::debug!(%task, %src, %dst, frozen, pending, "task migration");

        // Keep the counters balanced: the task's frozen status is
        // preserved across the move, never re-requested.
        if frozen {
            if let Some(dst_state) = book.groups.get_mut(&dst) {
                dst_state.inc_frozen_tasks();
            }
            if let Some(src_state) = book.groups.get_mut(&src) {
                src_state.dec_frozen_tasks(src);
            }
        }
        recompute(&mut book, &self.hierarchy, &self.events, dst);
        recompute(&mut book, &self.hierarchy, &self.events, src);

        // Force the task to the destination's effective state. A pending
        // stop request counts as freeze-side: it must be withdrawn when the
        // destination is not requesting, or the stop would land later and
        // leave the task frozen inside a thawed group.
        let want = book
            .groups
            .get(&dst)
            .is_some_and(|g| g.freeze_requested);
        if want && !frozen && !pending {
            driver::set_task_freeze(&mut book, &self.hierarchy, &self.events, &self.backend, task, true);
        } else if !want && (frozen || pending) {
            driver::set_task_freeze(&mut book, &self.hierarchy, &self.events, &self.backend, task, false);
        } else if want {
            // Already frozen or stopping and still wanted frozen: keep the
            // intent recorded without signalling the process.
            if let Some(state) = book.tasks.get_mut(&task) {
                state.freeze_pending = true;
            }
        }
        Ok(())
    }
}
