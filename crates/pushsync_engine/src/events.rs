//! Lifecycle events emitted by the engine.
//!
//! Events are fire-and-forget: emitting never blocks and never fails the
//! operation that produced it.

use crate::operation::{OperationId, OperationKind};
use parking_lot::Mutex;
use pushsync_core::{AttributesSet, EntityKind};
use std::time::Duration;
use tokio::sync::broadcast;

/// An engine lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An operation started executing.
    OperationStarted {
        /// Operation id.
        id: OperationId,
        /// Operation kind.
        kind: OperationKind,
    },
    /// An attempt failed transiently and will be retried.
    OperationRetrying {
        /// Operation id.
        id: OperationId,
        /// Operation kind.
        kind: OperationKind,
        /// Retry number (1-based).
        retry: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// An operation succeeded.
    OperationSucceeded {
        /// Operation id.
        id: OperationId,
        /// Operation kind.
        kind: OperationKind,
    },
    /// An operation failed terminally.
    OperationFailed {
        /// Operation id.
        id: OperationId,
        /// Operation kind.
        kind: OperationKind,
        /// Rendered error.
        error: String,
    },
    /// An operation was cancelled.
    OperationCancelled {
        /// Operation id.
        id: OperationId,
        /// Operation kind.
        kind: OperationKind,
    },
    /// A follow-up operation was enqueued.
    OperationChained {
        /// The finished operation.
        parent: OperationId,
        /// The follow-up operation.
        child: OperationId,
        /// The follow-up's kind.
        kind: OperationKind,
    },
    /// Stored entity attributes changed after a merge.
    EntityChanged {
        /// Entity kind.
        kind: EntityKind,
        /// Keys whose state changed.
        keys: AttributesSet,
    },
    /// New messages were stored.
    MessagesReceived {
        /// Ids of the new messages.
        message_ids: Vec<String>,
    },
}

/// Receiver of engine events.
pub trait EventSink: Send + Sync {
    /// Emits an event. Must not block.
    fn emit(&self, event: SyncEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SyncEvent) {}
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitting never waits.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

/// Records every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the recorded events.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Removes and returns the recorded events.
    pub fn drain(&self) -> Vec<SyncEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}
