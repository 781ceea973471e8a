// Consumers of finished updates
//
// The pipeline never waits on a sink beyond a single delivery; a sink that
// falls behind loses updates instead of building a queue.

use crate::series::SweepUpdate;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Presentation-side capability receiving pipeline output
pub trait Sink: Send + Sync {
    fn on_connection_changed(&self, connected: bool);

    fn on_sweep_update(&self, update: &SweepUpdate);

    fn on_progress(&self, percent: f64);
}

/// Events recorded by the bundled sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    ConnectionChanged { connected: bool },
    SweepUpdate(SweepUpdate),
    Progress { percent: f64 },
}

/// Strategy for handling a full queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum OverflowStrategy {
    /// Drop oldest events (ring buffer behavior)
    DropOldest,

    /// Drop the incoming event
    DropNewest,
}

/// Bounded lock-free queue of sink events
pub struct QueueSink {
    queue: ArrayQueue<SinkEvent>,
    overflow_strategy: OverflowStrategy,
    total_pushed: AtomicU64,
    total_dropped: AtomicU64,
}

impl QueueSink {
    pub fn new(capacity: usize, strategy: OverflowStrategy) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_strategy: strategy,
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: SinkEvent) {
        match self.overflow_strategy {
            OverflowStrategy::DropOldest => {
                if let Some(_evicted) = self.queue.force_push(event) {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            OverflowStrategy::DropNewest => {
                if self.queue.push(event).is_err() {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<SinkEvent> {
        self.queue.pop()
    }

    /// Remove every queued event, oldest first
    pub fn drain(&self) -> Vec<SinkEvent> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        events
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

impl Sink for QueueSink {
    fn on_connection_changed(&self, connected: bool) {
        self.push(SinkEvent::ConnectionChanged { connected });
    }

    fn on_sweep_update(&self, update: &SweepUpdate) {
        self.push(SinkEvent::SweepUpdate(update.clone()));
    }

    fn on_progress(&self, percent: f64) {
        self.push(SinkEvent::Progress { percent });
    }
}

/// Sink forwarding every event to a closure
pub struct CallbackSink<F>
where
    F: Fn(SinkEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: Fn(SinkEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> Sink for CallbackSink<F>
where
    F: Fn(SinkEvent) + Send + Sync,
{
    fn on_connection_changed(&self, connected: bool) {
        (self.callback)(SinkEvent::ConnectionChanged { connected });
    }

    fn on_sweep_update(&self, update: &SweepUpdate) {
        (self.callback)(SinkEvent::SweepUpdate(update.clone()));
    }

    fn on_progress(&self, percent: f64) {
        (self.callback)(SinkEvent::Progress { percent });
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Sink for NullSink {
    fn on_connection_changed(&self, _connected: bool) {}

    fn on_sweep_update(&self, _update: &SweepUpdate) {}

    fn on_progress(&self, _percent: f64) {}
}
