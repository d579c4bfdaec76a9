//! cryo-core - hierarchical freeze/thaw control for trees of process groups.
//!
//! This library drives an entire subtree of processes into a quiesced,
//! resumable state on request, tracks aggregate progress so observers can
//! learn when the subtree has actually stopped, and propagates status both
//! downward (a parent freeze request obligates every descendant group) and
//! upward (a group reports frozen only once every descendant does).
//!
//! The tree itself and the mechanism that stops a process are external
//! collaborators: the group tree is consumed through the
//! [`GroupHierarchy`] trait and the stop/resume primitive through the
//! [`QuiesceBackend`] trait. Completion is level-triggered and observed
//! asynchronously, via [`Freezer::is_frozen`] or the status-change event
//! stream; freeze and thaw requests themselves never fail for normal
//! operating conditions.
//!
//! # Modules
//!
//! - [`config`]: [`FreezerConfig`] with bounded event buffering
//! - [`controller`]: [`Freezer`], the administrative facade and lock owner
//! - [`driver`]: per-task freeze/thaw issuance, exemption rules, backends
//! - [`error`]: [`FreezerError`] taxonomy
//! - [`events`]: [`FreezeEvent`] status-change notification stream
//! - [`hierarchy`]: group/task identifiers, the [`GroupHierarchy`]
//!   collaborator trait, and [`MemoryHierarchy`] for embedders that own
//!   their own tree
//! - [`legacy`]: the self-contained per-subtree freezer with explicit
//!   self/parent freezing causes and fork-time enforcement
//! - [`state`]: per-group and per-task bookkeeping records
//!
//! # Locking
//!
//! Two lock classes, never conflated: a short-held bookkeeping lock
//! protecting all counters and per-task freeze fields (safe to take from
//! exit/migration paths, nothing blocks under it), and a request
//! serialization lock held across a whole administrative subtree walk,
//! taken only by [`Freezer::set_freeze`] and the legacy walk. The request
//! lock is always acquired strictly outside the bookkeeping lock.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod legacy;
mod propagate;
pub mod state;

pub use config::FreezerConfig;
pub use controller::Freezer;
pub use driver::{QuiesceAction, QuiesceBackend, RecordingBackend};
#[cfg(unix)]
pub use driver::SignalBackend;
pub use error::FreezerError;
pub use events::FreezeEvent;
pub use hierarchy::{GroupHierarchy, GroupId, MemoryHierarchy, TaskId};
pub use legacy::{LegacyFreezer, LegacyState};
pub use state::GroupStatus;
