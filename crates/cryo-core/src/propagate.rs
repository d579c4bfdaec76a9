//! Upward aggregation of frozen status through the ancestor chain.
//!
//! [`recompute`] re-evaluates a single group's aggregate condition and, on
//! a flip, walks strictly upward adjusting each ancestor's frozen
//! descendant count. The walk carries an accumulator: every ancestor that
//! flips as a result contributes its own +1 (or -1) to the next level, so
//! a leaf completing can freeze a whole chain of waiting ancestors in one
//! pass. Each level returns early when nothing changed, which both makes
//! the operation idempotent and bounds upward work to the ancestors whose
//! status actually flips.

use crate::events::EventSink;
use crate::hierarchy::{GroupHierarchy, GroupId};
use crate::state::Bookkeeping;

/// Re-evaluate `group`'s aggregate frozen status and propagate any flip
/// upward. Correct no-op when nothing changed. Caller holds the
/// bookkeeping lock.
pub(crate) fn recompute<H: GroupHierarchy + ?Sized>(
    book: &mut Bookkeeping,
    hierarchy: &H,
    events: &EventSink,
    group: GroupId,
) {
    let Some(state) = book.groups.get(&group) else {
        return;
    };
    let frozen = state.evaluate(hierarchy.task_count(group), hierarchy.descendant_count(group));

    let state = book
        .groups
        .get_mut(&group)
        .expect("group present above");
    if state.frozen == frozen {
        return;
    }
    state.frozen = frozen;
    events.emit(group, frozen);

    propagate_frozen(book, hierarchy, events, group, frozen);
}

/// Walk the ancestor chain after `group` flipped to `frozen`.
///
/// On an upward flip, freezing ancestors whose counts are now complete
/// flip too; on a downward flip, every frozen ancestor is forced out of
/// the frozen state.
fn propagate_frozen<H: GroupHierarchy + ?Sized>(
    book: &mut Bookkeeping,
    hierarchy: &H,
    events: &EventSink,
    group: GroupId,
    frozen: bool,
) {
    let mut contribution: u64 = 1;
    let mut cursor = group;

    while let Some(parent) = hierarchy.parent(cursor) {
        let Some(state) = book.groups.get_mut(&parent) else {
            break;
        };
        if frozen {
            state.frozen_descendant_count += contribution;
            if !state.frozen
                && state.freeze_requested
                && state.frozen_task_count == hierarchy.task_count(parent)
                && state.frozen_descendant_count == hierarchy.descendant_count(parent)
            {
                state.frozen = true;
                events.emit(parent, true);
                contribution += 1;
            }
        } else {
            state.dec_frozen_descendants(contribution, parent);
            if state.frozen {
                state.frozen = false;
                events.emit(parent, false);
                contribution += 1;
            }
        }
        cursor = parent;
    }
}

/// Erase a removed frozen group from every ancestor's frozen descendant
/// count, starting at `first_ancestor` (the removed group's old parent).
/// The hierarchy has already dropped the group from the descendant counts,
/// so no status can flip here; the caller recomputes the parent afterward.
pub(crate) fn forget_frozen_descendant<H: GroupHierarchy + ?Sized>(
    book: &mut Bookkeeping,
    hierarchy: &H,
    removed: GroupId,
    first_ancestor: GroupId,
) {
    let mut cursor = Some(first_ancestor);
    while let Some(ancestor) = cursor {
        if let Some(state) = book.groups.get_mut(&ancestor) {
            state.dec_frozen_descendants(1, removed);
        }
        cursor = hierarchy.parent(ancestor);
    }
}
