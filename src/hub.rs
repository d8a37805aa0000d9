//! Fan-out of task events to every live browser connection.
//!
//! A single dispatcher task drains one ordered queue, so every connection
//! sees events in the order they were published. Each connection is an
//! unbounded channel drained by that connection's socket writer; a closed
//! channel means the writer is gone and the connection is pruned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::events::ServerMessage;

pub type ConnectionId = u64;

/// Serialized message, shared by every recipient of one event.
pub type Payload = Arc<str>;

pub type Outbox = mpsc::UnboundedSender<Payload>;

/// Handle held by a session for its own registration.
///
/// Holds no sender of its own: once the hub drops the registration, the
/// session's receiver closes. Dropping it unregisters the connection.
pub struct Connection {
    id: ConnectionId,
    hub: BroadcastHub,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the hub still delivers to this connection.
    pub fn is_open(&self) -> bool {
        self.hub.inner.registry.lock().contains_key(&self.id)
    }

    /// Send a message to this connection only, bypassing the hub queue.
    pub fn send_private(&self, message: &ServerMessage) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(conn_id = self.id, "Failed to encode private message: {}", e);
                return false;
            }
        };
        let mut conns = self.hub.inner.registry.lock();
        let Some(outbox) = conns.get(&self.id) else {
            return false;
        };
        if outbox.send(Payload::from(json)).is_ok() {
            return true;
        }
        conns.remove(&self.id);
        tracing::debug!(conn_id = self.id, "Pruning closed connection");
        false
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[derive(Default)]
struct Registry {
    connections: Mutex<HashMap<ConnectionId, Outbox>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Outbox>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write one payload to every registered connection, pruning the dead.
    fn deliver(&self, payload: &Payload) {
        let mut conns = self.lock();
        conns.retain(|id, outbox| {
            let alive = outbox.send(payload.clone()).is_ok();
            if !alive {
                tracing::debug!(conn_id = *id, "Pruning closed connection");
            }
            alive
        });
    }
}

struct HubInner {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    queue: mpsc::UnboundedSender<Payload>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Owned registry of live connections plus its dispatcher.
///
/// Cheap to clone; all clones share the same registry and queue.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Create the hub and spawn its dispatcher on the current runtime.
    pub fn start() -> Self {
        let registry = Arc::new(Registry::default());
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = tokio::spawn(dispatch_loop(registry.clone(), queue_rx, shutdown_rx));

        Self {
            inner: Arc::new(HubInner {
                registry,
                next_id: AtomicU64::new(1),
                queue,
                shutdown_tx,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        }
    }

    /// Add a connection. The receiver yields every payload addressed to it
    /// and closes when the hub drops the connection.
    ///
    /// After shutdown the receiver is returned already closed.
    pub fn register(&self) -> (Connection, mpsc::UnboundedReceiver<Payload>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::unbounded_channel();
        {
            // Checked under the registry lock so shutdown's clear cannot miss it.
            let mut conns = self.inner.registry.lock();
            if *self.inner.shutdown_tx.borrow() {
                tracing::debug!(conn_id = id, "Hub is shut down; connection refused");
            } else {
                conns.insert(id, outbox);
                tracing::debug!(conn_id = id, "Connection registered");
            }
        }

        let conn = Connection {
            id,
            hub: self.clone(),
        };
        (conn, rx)
    }

    /// Remove a connection. Unknown or already-removed ids are ignored.
    pub fn unregister(&self, id: ConnectionId) {
        if self.inner.registry.lock().remove(&id).is_some() {
            tracing::debug!(conn_id = id, "Connection unregistered");
        }
    }

    /// Queue an event for delivery to all connections. Returns once queued.
    pub fn publish(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to encode event: {}", e);
                return;
            }
        };
        if self.inner.queue.send(Payload::from(json)).is_err() {
            tracing::debug!("Hub dispatcher stopped; event dropped");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Stop the dispatcher and close every connection's receiver.
    ///
    /// Events still queued are dropped.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::error!("Hub dispatcher panicked: {}", e);
            }
        }

        let mut conns = self.inner.registry.lock();
        let count = conns.len();
        conns.clear();
        tracing::info!(count, "Closed all hub connections");
    }
}

async fn dispatch_loop(
    registry: Arc<Registry>,
    mut queue: mpsc::UnboundedReceiver<Payload>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            payload = queue.recv() => match payload {
                Some(payload) => registry.deliver(&payload),
                None => break,
            },
        }
    }
    tracing::debug!("Hub dispatcher stopped");
}
