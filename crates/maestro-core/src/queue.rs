//! Bounded async event queue with a single consumer loop.
//!
//! Producers (task updaters) enqueue events; the consumer loop dispatches
//! each event to the handlers registered for its [`EventType`]. A full queue
//! blocks producers instead of dropping events.

use crate::error::{MaestroError, MaestroResult};
use crate::event::{Event, EventType};
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default queue capacity (events).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// How long the consumer waits for an event before re-checking for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives events of the types it was registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are logged by the queue and never stop it.
    async fn handle(&self, event: &Event) -> MaestroResult<()>;
}

type HandlerMap = HashMap<EventType, Vec<Arc<dyn EventHandler>>>;

/// Bounded pub/sub bus decoupling task execution from the transport layer.
pub struct EventQueue {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    handlers: Arc<RwLock<HandlerMap>>,
    poll_interval: Duration,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        Self::with_poll_interval(capacity, DEFAULT_POLL_INTERVAL)
    }

    /// Queue with a custom idle poll interval.
    pub fn with_poll_interval(capacity: usize, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            poll_interval,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a handler for one event type.
    pub fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Register a handler for every event type.
    pub fn register_all(&self, handler: Arc<dyn EventHandler>) {
        self.register(EventType::StatusUpdate, handler.clone());
        self.register(EventType::ArtifactUpdate, handler);
    }

    /// Forward every event into a fresh channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register_all(Arc::new(ForwardingHandler { tx }));
        rx
    }

    /// Enqueue an event, waiting for room when the queue is full.
    pub async fn enqueue(&self, event: Event) -> MaestroResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MaestroError::QueueClosed);
        }
        debug!(event_type = %event.event_type(), task_id = %event.task_id(), "EventQueue::enqueue");
        self.tx
            .send(event)
            .await
            .map_err(|_| MaestroError::QueueClosed)
    }

    /// Number of events waiting for the consumer.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether the consumer loop is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the consumer loop. Fails if it was already started.
    pub fn start(&self) -> MaestroResult<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| MaestroError::Queue("event queue already started".into()))?;
        let handlers = self.handlers.clone();
        let cancel = self.cancel.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    // Deliver what producers already handed over, accept nothing new.
                    rx.close();
                    while let Ok(event) = rx.try_recv() {
                        dispatch(&handlers, &event).await;
                    }
                    break;
                }
                match tokio::time::timeout(poll_interval, rx.recv()).await {
                    Ok(Some(event)) => dispatch(&handlers, &event).await,
                    Ok(None) => break,
                    Err(_) => continue,
                }
            }
            debug!("EventQueue consumer loop exited");
        });
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Stop the consumer loop and wait for it to exit.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "EventQueue consumer loop did not exit cleanly");
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch(handlers: &RwLock<HandlerMap>, event: &Event) {
    let targets: Vec<Arc<dyn EventHandler>> = handlers
        .read()
        .get(&event.event_type())
        .cloned()
        .unwrap_or_default();

    for handler in targets {
        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(event_id = %event.id, event_type = %event.event_type(), error = %e, "Event handler failed");
            }
            Err(_) => {
                error!(event_id = %event.id, event_type = %event.event_type(), "Event handler panicked");
            }
        }
    }
}

/// Handler that copies events into an unbounded channel.
struct ForwardingHandler {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle(&self, event: &Event) -> MaestroResult<()> {
        if self.tx.send(event.clone()).is_err() {
            debug!(event_id = %event.id, "Subscriber gone, dropping event");
        }
        Ok(())
    }
}
