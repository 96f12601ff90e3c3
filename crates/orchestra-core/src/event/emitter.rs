//! Per-execution event fan-out.
//!
//! Every event is first appended to the execution's log, then broadcast on
//! that execution's channel. A subscription starts with a backlog snapshot of
//! the log and continues with live events, so late subscribers see the full
//! history in order.
//!
//! Each execution gets its own `tokio::sync::broadcast` channel. A subscriber
//! that falls more than `capacity` events behind loses the oldest ones; the
//! loss is counted in the engine-wide dropped counter and never blocks the
//! emitter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::Stream;
use orchestra_types::event::WorkflowEvent;
use orchestra_types::execution::WorkflowExecution;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Fan-out hub for workflow events.
///
/// Cloning shares the channel registry and counters.
pub struct EventEmitter {
    channels: Arc<DashMap<Uuid, broadcast::Sender<WorkflowEvent>>>,
    subscriptions: Arc<DashMap<Uuid, CancellationToken>>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl EventEmitter {
    /// `capacity` is the per-subscriber queue length.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Open the live channel for an execution.
    pub fn open(&self, execution_id: Uuid) {
        self.channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Close an execution's channel. Subscribers drain what they have and
    /// then see the end of the stream.
    pub fn close(&self, execution_id: Uuid) {
        self.channels.remove(&execution_id);
    }

    /// Append an event to the execution log and broadcast it.
    ///
    /// Callers hold the execution lock, which keeps log order and delivery
    /// order identical.
    pub fn emit(&self, execution: &mut WorkflowExecution, event: WorkflowEvent) {
        tracing::debug!(
            execution_id = %execution.id,
            event_type = ?event.event_type,
            step_id = event.step_id.as_deref(),
            "workflow event"
        );
        execution.events.push(event.clone());
        if let Some(sender) = self.channels.get(&execution.id) {
            // No receivers is fine.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to an execution, replaying `backlog` first.
    ///
    /// Callers take `backlog` under the same lock used for [`emit`](Self::emit)
    /// so nothing falls between the snapshot and the live feed. When the
    /// execution has no open channel the subscription yields only the backlog.
    pub fn subscribe(&self, execution_id: Uuid, backlog: Vec<WorkflowEvent>) -> EventSubscription {
        let receiver = self.channels.get(&execution_id).map(|tx| tx.subscribe());
        let id = Uuid::now_v7();
        let closed = CancellationToken::new();
        self.subscriptions.insert(id, closed.clone());

        EventSubscription {
            id,
            execution_id,
            backlog: backlog.into(),
            receiver,
            closed,
            dropped: Arc::clone(&self.dropped),
            local_dropped: 0,
            registry: Arc::clone(&self.subscriptions),
        }
    }

    /// Stop a subscription. Returns false for unknown ids.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        match self.subscriptions.remove(&subscription_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Events dropped from slow subscribers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared handle to the dropped counter, for health reporting.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
            subscriptions: Arc::clone(&self.subscriptions),
            dropped: Arc::clone(&self.dropped),
            capacity: self.capacity,
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("open_channels", &self.channels.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventSubscription
// ---------------------------------------------------------------------------

/// Ordered view of one execution's events: backlog, then live.
pub struct EventSubscription {
    id: Uuid,
    execution_id: Uuid,
    backlog: VecDeque<WorkflowEvent>,
    receiver: Option<broadcast::Receiver<WorkflowEvent>>,
    closed: CancellationToken,
    dropped: Arc<AtomicU64>,
    local_dropped: u64,
    registry: Arc<DashMap<Uuid, CancellationToken>>,
}

impl EventSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Events this subscriber lost by falling behind.
    pub fn dropped(&self) -> u64 {
        self.local_dropped
    }

    /// Next event, or `None` once the execution's channel is closed or the
    /// subscription was cancelled.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        if self.closed.is_cancelled() {
            return None;
        }
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            let result = tokio::select! {
                biased;
                () = self.closed.cancelled() => return None,
                result = receiver.recv() => result,
            };
            match result {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.local_dropped += missed;
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        subscription_id = %self.id,
                        missed,
                        "subscriber fell behind, oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Consume the subscription as a stream of events.
    pub fn into_stream(mut self) -> impl Stream<Item = WorkflowEvent> + Send {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .field("execution_id", &self.execution_id)
            .field("backlog", &self.backlog.len())
            .field("live", &self.receiver.is_some())
            .finish()
    }
}
