//! The operation queue.
//!
//! A bounded worker pool with one lane per resource id. Within a lane at
//! most one mutating operation runs at a time and never alongside readers;
//! readers may run together. Pending entries are ordered by priority, then
//! by enqueue order. A reader queued behind a waiting mutator does not
//! overtake it, and nothing is preempted once started.

use crate::builder::OperationBuilder;
use crate::chain::ChainPolicy;
use crate::error::SyncError;
use crate::events::{EventSink, SyncEvent};
use crate::executor::Executor;
use crate::operation::{
    CancelToken, OperationId, OperationKind, OperationResult, OperationState, SyncOperation,
};
use parking_lot::Mutex;
use pushsync_core::ResourceId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Notify, Semaphore};

struct Entry {
    op: Arc<SyncOperation>,
    done: oneshot::Sender<OperationResult>,
}

#[derive(Default)]
struct Lane {
    pending: Vec<Entry>,
    writer_running: bool,
    readers_running: usize,
}

impl Lane {
    /// Inserts behind every entry of equal or higher priority.
    fn push(&mut self, entry: Entry) {
        let priority = entry.op.priority();
        let pos = self
            .pending
            .iter()
            .position(|e| e.op.priority() < priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, entry);
    }

    /// Takes the head entry if the lane admits it, claiming the slot.
    fn next_startable(&mut self) -> Option<Entry> {
        let head = self.pending.first()?;
        let admitted = if head.op.is_mutating() {
            !self.writer_running && self.readers_running == 0
        } else {
            !self.writer_running
        };
        if !admitted {
            return None;
        }
        let entry = self.pending.remove(0);
        if entry.op.is_mutating() {
            self.writer_running = true;
        } else {
            self.readers_running += 1;
        }
        Some(entry)
    }

    fn startable(&mut self) -> Vec<Entry> {
        std::iter::from_fn(|| self.next_startable()).collect()
    }

    fn release(&mut self, mutating: bool) {
        if mutating {
            self.writer_running = false;
        } else {
            self.readers_running = self.readers_running.saturating_sub(1);
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.writer_running && self.readers_running == 0
    }
}

#[derive(Default)]
struct QueueState {
    closed: bool,
    lanes: HashMap<ResourceId, Lane>,
    /// Pending plus running operations.
    active: usize,
}

struct QueueInner {
    state: Mutex<QueueState>,
    permits: Arc<Semaphore>,
    executor: Arc<Executor>,
    builder: Arc<OperationBuilder>,
    chain: Arc<dyn ChainPolicy>,
    events: Arc<dyn EventSink>,
    idle: Notify,
}

impl QueueInner {
    fn submit(self: &Arc<Self>, op: SyncOperation) -> Result<OperationHandle, SyncError> {
        let (tx, rx) = oneshot::channel();
        let op = Arc::new(op);
        let handle = OperationHandle {
            id: op.id(),
            kind: op.kind(),
            cancel: op.cancel_token().clone(),
            rx,
            queue: Arc::downgrade(self),
        };

        let to_start = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SyncError::QueueClosed);
            }
            state.active += 1;
            let lane = state.lanes.entry(op.resource_id().clone()).or_default();
            lane.push(Entry {
                op: Arc::clone(&op),
                done: tx,
            });
            lane.startable()
        };
        tracing::trace!(id = %op.id(), kind = %op.kind(), priority = ?op.priority(), "operation enqueued");

        for entry in to_start {
            self.spawn(entry);
        }
        Ok(handle)
    }

    fn spawn(self: &Arc<Self>, entry: Entry) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let Entry { op, done } = entry;
            let result = match Arc::clone(&inner.permits).acquire_owned().await {
                Ok(permit) => {
                    let result = inner.executor.execute(&op).await;
                    drop(permit);
                    inner.chain(&op, result)
                }
                Err(_) => OperationResult::Failure(SyncError::QueueClosed),
            };
            inner.finish(&op);
            let _ = done.send(result);
        });
    }

    fn chain(self: &Arc<Self>, op: &SyncOperation, result: OperationResult) -> OperationResult {
        let Some(follow_up) = self.chain.follow_up(op.kind(), &result) else {
            return result;
        };
        let next = match self.builder.follow_up(follow_up) {
            Ok(Some(next)) => next,
            Ok(None) => return result,
            Err(err) => {
                tracing::warn!(parent = %op.id(), error = %err, "follow-up not built");
                return result;
            }
        };

        let (child, kind) = (next.id(), next.kind());
        if let Err(err) = self.submit(next) {
            tracing::warn!(parent = %op.id(), error = %err, "follow-up not enqueued");
            return result;
        }
        tracing::info!(parent = %op.id(), child = %child, kind = %kind, "follow-up enqueued");
        self.events.emit(SyncEvent::OperationChained {
            parent: op.id(),
            child,
            kind,
        });

        match result {
            OperationResult::Success { outcome, .. } => OperationResult::Success {
                outcome,
                chained: Some(child),
            },
            other => other,
        }
    }

    /// Releases the lane slot held by `op` and starts whatever it unblocks.
    fn finish(self: &Arc<Self>, op: &SyncOperation) {
        let (to_start, idle) = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            let mut to_start = Vec::new();
            if let Some(lane) = state.lanes.get_mut(op.resource_id()) {
                lane.release(op.is_mutating());
                to_start = lane.startable();
                if lane.is_idle() {
                    state.lanes.remove(op.resource_id());
                }
            }
            (to_start, state.active == 0)
        };
        for entry in to_start {
            self.spawn(entry);
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Removes a pending entry. Returns false if it is not pending.
    fn cancel_pending(self: &Arc<Self>, id: OperationId) -> bool {
        let (removed, to_start, idle) = {
            let mut state = self.state.lock();
            let mut removed = None;
            let mut to_start = Vec::new();
            for lane in state.lanes.values_mut() {
                if let Some(pos) = lane.pending.iter().position(|e| e.op.id() == id) {
                    removed = Some(lane.pending.remove(pos));
                    // The removed entry may have been blocking readers.
                    to_start = lane.startable();
                    break;
                }
            }
            if removed.is_some() {
                state.active = state.active.saturating_sub(1);
                state.lanes.retain(|_, lane| !lane.is_idle());
            }
            (removed, to_start, state.active == 0)
        };

        for entry in to_start {
            self.spawn(entry);
        }
        let Some(entry) = removed else {
            return false;
        };
        self.resolve_cancelled(entry);
        if idle {
            self.idle.notify_waiters();
        }
        true
    }

    fn resolve_cancelled(&self, entry: Entry) {
        entry.op.cancel();
        if let Err(err) = entry.op.transition(OperationState::Cancelled) {
            tracing::warn!(id = %entry.op.id(), error = %err, "unexpected operation state");
        }
        self.events.emit(SyncEvent::OperationCancelled {
            id: entry.op.id(),
            kind: entry.op.kind(),
        });
        let _ = entry.done.send(OperationResult::Cancel);
    }
}

/// Schedules operations on a bounded worker pool with per-resource lanes.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    /// Creates a queue running at most `workers` operations at once.
    pub fn new(
        executor: Arc<Executor>,
        builder: Arc<OperationBuilder>,
        chain: Arc<dyn ChainPolicy>,
        events: Arc<dyn EventSink>,
        workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                permits: Arc::new(Semaphore::new(workers.max(1))),
                executor,
                builder,
                chain,
                events,
                idle: Notify::new(),
            }),
        }
    }

    /// Enqueues an operation at its own priority.
    ///
    /// The returned handle always resolves exactly once; on a closed queue
    /// it resolves immediately with `SyncError::QueueClosed`.
    pub fn enqueue(&self, op: SyncOperation) -> OperationHandle {
        let (id, kind, cancel) = (op.id(), op.kind(), op.cancel_token().clone());
        match self.inner.submit(op) {
            Ok(handle) => handle,
            Err(err) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(OperationResult::Failure(err));
                OperationHandle {
                    id,
                    kind,
                    cancel,
                    rx,
                    queue: Weak::new(),
                }
            }
        }
    }

    /// Cancels a pending operation. Returns false if it is not pending.
    pub fn cancel_pending(&self, id: OperationId) -> bool {
        self.inner.cancel_pending(id)
    }

    /// Rejects new operations and cancels every pending one. Running
    /// operations finish normally.
    pub fn shutdown(&self) {
        let (drained, idle) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let mut drained = Vec::new();
            for lane in state.lanes.values_mut() {
                drained.append(&mut lane.pending);
            }
            state.active = state.active.saturating_sub(drained.len());
            state.lanes.retain(|_, lane| !lane.is_idle());
            (drained, state.active == 0)
        };
        tracing::info!(cancelled = drained.len(), "operation queue shut down");
        for entry in drained {
            self.inner.resolve_cancelled(entry);
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Returns true after `shutdown`.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of pending plus running operations.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Number of operations waiting for a lane slot.
    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .values()
            .map(|lane| lane.pending.len())
            .sum()
    }

    /// Resolves once no operation is pending or running, including any
    /// follow-ups chained in the meantime.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("OperationQueue")
            .field("closed", &state.closed)
            .field("active", &state.active)
            .field("lanes", &state.lanes.len())
            .finish()
    }
}

/// Completion handle of an enqueued operation.
pub struct OperationHandle {
    id: OperationId,
    kind: OperationKind,
    cancel: CancelToken,
    rx: oneshot::Receiver<OperationResult>,
    queue: Weak<QueueInner>,
}

impl OperationHandle {
    /// Operation id.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Cancels the operation.
    ///
    /// A pending operation is removed and resolves with `Cancel` right
    /// away; a running one observes the flag at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(queue) = self.queue.upgrade() {
            queue.cancel_pending(self.id);
        }
    }

    /// Waits for the terminal result.
    pub async fn wait(self) -> OperationResult {
        self.rx
            .await
            .unwrap_or_else(|_| OperationResult::Failure(SyncError::QueueClosed))
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
