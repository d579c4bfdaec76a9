//! Per-task freeze/thaw issuance and exemption rules.
//!
//! The driver never stops a process itself. It records intent in the task's
//! bookkeeping and asks a [`QuiesceBackend`] to quiesce or wake the
//! process; the transition into the frozen state is reported back later by
//! the process reaching its stop point ([`crate::Freezer::task_quiesced`]).
//! Exempt tasks are skipped entirely. A task that has already exited is
//! silently skipped too: freezing is level-triggered, there is no retry.

use crate::events::EventSink;
use crate::hierarchy::{GroupHierarchy, TaskId};
use crate::propagate::recompute;
use crate::state::Bookkeeping;

/// The process-scheduling collaborator that actually stops and wakes
/// processes.
///
/// Implementations must not block: both methods are called with the
/// freezer's bookkeeping lock held, from paths that cannot sleep. A
/// quiesce request only has to *eventually* stop the process; completion
/// is reported back through the freezer's task hooks.
pub trait QuiesceBackend: Send + Sync {
    /// Ask the process to stop at its next quiesce point.
    fn request_quiesce(&self, task: TaskId);

    /// Withdraw the quiesce request and wake the process.
    fn request_resume(&self, task: TaskId);
}

impl<B: QuiesceBackend + ?Sized> QuiesceBackend for std::sync::Arc<B> {
    fn request_quiesce(&self, task: TaskId) {
        (**self).request_quiesce(task);
    }

    fn request_resume(&self, task: TaskId) {
        (**self).request_resume(task);
    }
}

/// Freeze or thaw one task. Caller holds the bookkeeping lock.
///
/// Freezing marks the intent pending and requests quiesce unless the task
/// is already frozen, so an already-stopped task never sees a redundant
/// signal. Thawing withdraws the intent, wakes the process, and if it had
/// reached the frozen state, gives the frozen count back to its owning
/// group and recomputes.
pub(crate) fn set_task_freeze<H, B>(
    book: &mut Bookkeeping,
    hierarchy: &H,
    events: &EventSink,
    backend: &B,
    task: TaskId,
    freeze: bool,
) where
    H: GroupHierarchy + ?Sized,
    B: QuiesceBackend + ?Sized,
{
    // A task that already exited is not worth freezing.
    let Some(state) = book.tasks.get_mut(&task) else {
        return;
    };
    if state.exempt {
        return;
    }

    if freeze {
        state.freeze_pending = true;
        if !state.frozen {
            tracing::trace!(%task, "requesting quiesce");
            backend.request_quiesce(task);
        }
    } else {
        state.freeze_pending = false;
        let was_frozen = state.frozen;
        state.frozen = false;
        let group = state.owning_group;
        tracing::trace!(%task, "requesting resume");
        backend.request_resume(task);
        if was_frozen {
            if let Some(group_state) = book.groups.get_mut(&group) {
                group_state.dec_frozen_tasks(group);
            }
            recompute(book, hierarchy, events, group);
        }
    }
}

/// A backend action, as recorded by [`RecordingBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceAction {
    /// A quiesce request was issued for the task.
    Quiesce(TaskId),
    /// A resume request was issued for the task.
    Resume(TaskId),
}

/// Test backend that records every issued action.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    actions: parking_lot::Mutex<Vec<QuiesceAction>>,
}

impl RecordingBackend {
    /// Create an empty recording backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything recorded so far.
    pub fn take(&self) -> Vec<QuiesceAction> {
        std::mem::take(&mut self.actions.lock())
    }
}

impl QuiesceBackend for RecordingBackend {
    fn request_quiesce(&self, task: TaskId) {
        self.actions.lock().push(QuiesceAction::Quiesce(task));
    }

    fn request_resume(&self, task: TaskId) {
        self.actions.lock().push(QuiesceAction::Resume(task));
    }
}

/// Backend that stops and resumes real processes with job-control signals,
/// treating each [`TaskId`] as an OS pid.
///
/// Delivery failures are logged and otherwise ignored; a task that cannot
/// be signalled (usually: already exited) is handled by the exit hook.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalBackend;

#[cfg(unix)]
impl SignalBackend {
    fn send(task: TaskId, signal: nix::sys::signal::Signal) {
        let Ok(pid) = i32::try_from(task.0) else {
            tracing::warn!(%task, "task id is not a valid pid");
            return;
        };
        let pid = nix::unistd::Pid::from_raw(pid);
        if let Err(err) = nix::sys::signal::kill(pid, signal) {
            tracing::warn!(%task, %err, ?signal, "signal delivery failed");
        }
    }
}

#[cfg(unix)]
impl QuiesceBackend for SignalBackend {
    fn request_quiesce(&self, task: TaskId) {
        Self::send(task, nix::sys::signal::Signal::SIGSTOP);
    }

    fn request_resume(&self, task: TaskId) {
        Self::send(task, nix::sys::signal::Signal::SIGCONT);
    }
}
