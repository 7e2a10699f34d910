//! Pipeline primitive.
//!
//! Messages pass through an ordered chain of layers between the application
//! and the wire. The chain is an explicit arena indexed bottom (wire side)
//! to top (application side), so neighbor lookup is positional and the
//! chain cannot form a cycle.
//!
//! Lifecycle and delivery events are fanned out through an [`EventHub`]: a
//! queue drained by one dispatch task, so emitting never blocks the layer
//! that produced the event and a failing handler never stops the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::StackError;
use crate::types::{EventKind, Message, StackEvent};

/// A handler registered for one event kind.
pub type EventHandler = Arc<dyn Fn(&StackEvent) + Send + Sync>;

/// One node in the pipeline.
///
/// `receive_from_upper` sees messages moving toward the wire,
/// `receive_from_lower` messages moving toward the application. Both
/// default to pass-through; processing layers override the direction they
/// care about. Returning `Ok(None)` consumes the message.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Name used in log lines and error events.
    fn name(&self) -> &str;

    /// Called when the pipeline starts, bottom to top.
    async fn on_start(&self) -> Result<(), StackError> {
        Ok(())
    }

    /// Called when the pipeline stops, top to bottom.
    async fn on_stop(&self) {}

    /// Process a message moving down (application → wire).
    async fn receive_from_upper(&self, message: Message) -> Result<Option<Message>, StackError> {
        Ok(Some(message))
    }

    /// Process a message moving up (wire → application).
    async fn receive_from_lower(&self, message: Message) -> Result<Option<Message>, StackError> {
        Ok(Some(message))
    }
}

struct HubShared {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

enum HubMessage {
    Event(StackEvent),
    Shutdown,
}

/// Fire-and-forget event dispatch.
///
/// Clones share one queue and one handler table. `emit` never blocks;
/// handlers run on the dispatch task, and a panicking handler is caught
/// and logged without affecting the rest.
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::UnboundedSender<HubMessage>,
    shared: Arc<HubShared>,
    dispatch: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventHub {
    /// Create the hub and spawn its dispatch task. Must run inside a tokio
    /// runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::new(HubShared {
            handlers: RwLock::new(HashMap::new()),
        });

        let dispatch_shared = Arc::clone(&shared);
        let dispatch = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let event = match item {
                    HubMessage::Event(event) => event,
                    HubMessage::Shutdown => break,
                };
                let handlers = {
                    let table = match dispatch_shared.handlers.read() {
                        Ok(table) => table,
                        Err(_) => {
                            error!("event handler table poisoned; dropping {:?}", event.kind());
                            continue;
                        }
                    };
                    table.get(&event.kind()).cloned().unwrap_or_default()
                };
                for handler in handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                        error!("event handler for {:?} panicked", event.kind());
                    }
                }
            }
        });

        Self {
            tx,
            shared,
            dispatch: Arc::new(Mutex::new(Some(dispatch))),
        }
    }

    /// Register a handler for one event kind.
    pub fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&StackEvent) + Send + Sync + 'static,
    {
        if let Ok(mut table) = self.shared.handlers.write() {
            table.entry(kind).or_default().push(Arc::new(handler));
        }
    }

    /// Queue an event for dispatch. Never blocks the caller.
    pub fn emit(&self, event: StackEvent) {
        if self.tx.send(HubMessage::Event(event)).is_err() {
            debug!("event hub already shut down; event dropped");
        }
    }

    /// Drain the queue and stop the dispatch task. Events emitted before
    /// this call are delivered before it returns.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(HubMessage::Shutdown);
        let handle = self.dispatch.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered layer chain, index 0 at the wire side.
pub struct Pipeline {
    layers: Vec<Arc<dyn Layer>>,
    events: EventHub,
}

impl Pipeline {
    pub fn new(events: EventHub) -> Self {
        Self {
            layers: Vec::new(),
            events,
        }
    }

    /// Append a layer above the current top. Returns its index.
    pub fn push(&mut self, layer: Arc<dyn Layer>) -> usize {
        self.layers.push(layer);
        self.layers.len() - 1
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Start every layer, bottom to top. The first failure aborts the
    /// start and is returned.
    pub async fn start(&self) -> Result<(), StackError> {
        for layer in &self.layers {
            layer.on_start().await?;
        }
        Ok(())
    }

    /// Stop every layer, top to bottom.
    pub async fn stop(&self) {
        for layer in self.layers.iter().rev() {
            layer.on_stop().await;
        }
    }

    /// Push a message down from the application toward the wire. The
    /// bottom layer is expected to consume it; errors surface to the
    /// caller so explicit sends can fail loudly.
    pub async fn send_down(&self, message: Message) -> Result<(), StackError> {
        let mut current = message;
        for layer in self.layers.iter().rev() {
            match layer.receive_from_upper(current).await? {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
        warn!("message fell past the bottom of the pipeline: {}", current.kind());
        Ok(())
    }

    /// Push a message up from the layer at `from` toward the application.
    /// A message that clears the top is delivered as a
    /// [`StackEvent::Message`]. Layer failures are logged and reported as
    /// error events; they never propagate.
    pub async fn send_up_from(&self, from: usize, message: Message) {
        let mut current = message;
        for layer in self.layers.iter().skip(from + 1) {
            match layer.receive_from_lower(current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => return,
                Err(err) => {
                    warn!("layer {} dropped an inbound message: {}", layer.name(), err);
                    self.events.emit(StackEvent::Error {
                        layer: layer.name().to_string(),
                        reason: err.to_string(),
                        message: None,
                    });
                    return;
                }
            }
        }
        self.events.emit(StackEvent::Message(current));
    }

    /// The hub this pipeline reports through.
    pub fn events(&self) -> &EventHub {
        &self.events
    }
}
