//! Status-change notification stream.
//!
//! One event per group whenever its aggregate frozen value flips, plus a
//! courtesy event when an administrative request changed nothing (the
//! target can already be in the desired state, or locked in the opposite
//! one by an ancestor; either way the observer should not keep waiting).
//!
//! Emission happens while the bookkeeping lock is held, so it must never
//! block: the channel is bounded and overflow drops the oldest pending
//! event to make room for the newest.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Deserialize, Serialize};

use crate::hierarchy::GroupId;

/// A group's aggregate frozen status changed (or was re-announced).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeEvent {
    /// The group whose status this event describes.
    pub group: GroupId,

    /// The aggregate frozen value at emission time.
    pub frozen: bool,
}

#[derive(Debug)]
pub(crate) struct EventSink {
    tx: Sender<FreezeEvent>,
    rx: Receiver<FreezeEvent>,
    dropped: AtomicU64,
}

impl EventSink {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Emit without blocking. On overflow, drop the oldest pending event.
    pub(crate) fn emit(&self, group: GroupId, frozen: bool) {
        tracing::debug!(%group, frozen, "freeze status change");
        let event = FreezeEvent { group, frozen };
        if self.tx.try_send(event).is_err() {
            let _ = self.rx.try_recv();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.tx.try_send(event);
        }
    }

    /// A receiver for the stream. Receivers share one queue: each event is
    /// delivered to exactly one of them.
    pub(crate) fn subscribe(&self) -> Receiver<FreezeEvent> {
        self.rx.clone()
    }

    /// Number of events dropped to overflow so far.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_receive() {
        let sink = EventSink::with_capacity(4);
        let rx = sink.subscribe();

        sink.emit(GroupId(1), true);
        sink.emit(GroupId(1), false);

        assert_eq!(
            rx.try_recv().unwrap(),
            FreezeEvent {
                group: GroupId(1),
                frozen: true
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            FreezeEvent {
                group: GroupId(1),
                frozen: false
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let sink = EventSink::with_capacity(2);
        let rx = sink.subscribe();

        sink.emit(GroupId(1), true);
        sink.emit(GroupId(2), true);
        sink.emit(GroupId(3), true);

        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().group, GroupId(2));
        assert_eq!(rx.try_recv().unwrap().group, GroupId(3));
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = FreezeEvent {
            group: GroupId(42),
            frozen: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let restored: FreezeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, restored);
    }
}
