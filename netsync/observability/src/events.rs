//! In-process event dispatch.
//!
//! Each [`EventDispatcher`] owns a bounded queue and a single delivery task.
//! `post` never blocks and never fails: an event that finds the queue full
//! is dropped and counted. Listeners run on the delivery task, one event at
//! a time, so a listener sees events in posting order and is never
//! re-entered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use netsync_shared_types::SyncEvent;

/// Receives events posted to a dispatcher.
pub trait EventListener<E>: Send + Sync {
    fn event(&self, event: &E);
}

/// Handle returned by [`EventDispatcher::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum DispatchMessage<E> {
    Event(E),
    Flush(oneshot::Sender<()>),
}

type ListenerList<E> = Arc<RwLock<Vec<(ListenerId, Arc<dyn EventListener<E>>)>>>;

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub posted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub events_by_type: HashMap<String, u64>,
}

#[derive(Default)]
struct DispatchMetrics {
    posted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    by_type: Mutex<HashMap<&'static str, u64>>,
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Fire-and-forget pub/sub sink for one event class.
pub struct EventDispatcher<E: SyncEvent> {
    name: String,
    capacity: usize,
    sender: mpsc::Sender<DispatchMessage<E>>,
    listeners: ListenerList<E>,
    next_listener: AtomicU64,
    metrics: Arc<DispatchMetrics>,
}

impl<E: SyncEvent> EventDispatcher<E> {
    /// Creates a dispatcher with [`DEFAULT_QUEUE_CAPACITY`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a dispatcher holding at most `capacity` undelivered events
    /// and spawns its delivery task. A zero capacity is raised to one.
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let listeners: ListenerList<E> = Arc::new(RwLock::new(Vec::new()));
        let metrics = Arc::new(DispatchMetrics::default());

        tokio::spawn(Self::deliver(
            name.clone(),
            receiver,
            Arc::clone(&listeners),
            Arc::clone(&metrics),
        ));
        debug!(dispatcher = %name, capacity, "Event dispatcher started");

        Self {
            name,
            capacity,
            sender,
            listeners,
            next_listener: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queues an event for delivery to every registered listener.
    pub fn post(&self, event: E) {
        trace!(dispatcher = %self.name, event_type = event.event_type(), "Posting event");
        self.metrics.posted.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(DispatchMessage::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(dispatcher = %self.name, "Event queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(dispatcher = %self.name, "Delivery task is gone, event dropped");
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<E>>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns false if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Resolves once every event posted before this call has been delivered.
    /// Waits for queue space rather than dropping the marker.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(DispatchMessage::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let events_by_type = self
            .metrics
            .by_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, count)| (name.to_string(), *count))
            .collect();
        DispatchStats {
            posted: self.metrics.posted.load(Ordering::Relaxed),
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            events_by_type,
        }
    }

    async fn deliver(
        name: String,
        mut receiver: mpsc::Receiver<DispatchMessage<E>>,
        listeners: ListenerList<E>,
        metrics: Arc<DispatchMetrics>,
    ) {
        while let Some(message) = receiver.recv().await {
            match message {
                DispatchMessage::Event(event) => {
                    let targets: Vec<_> = listeners
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .iter()
                        .map(|(_, listener)| Arc::clone(listener))
                        .collect();
                    for listener in targets {
                        listener.event(&event);
                    }
                    metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    *metrics
                        .by_type
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(event.event_type())
                        .or_insert(0) += 1;
                }
                DispatchMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(dispatcher = %name, "Event dispatcher stopped");
    }
}

/// Listener that keeps every event it receives. Handy in tests and demos.
pub struct CollectingListener<E> {
    events: Mutex<Vec<E>>,
}

impl<E> Default for CollectingListener<E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> CollectingListener<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl<E: Clone + Send> EventListener<E> for CollectingListener<E> {
    fn event(&self, event: &E) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
