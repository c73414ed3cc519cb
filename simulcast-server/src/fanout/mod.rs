//! Control-event fan-out subsystem
//!
//! Broadcast-once, fan-out-locally: each worker process holds exactly one
//! subscription to the control bus covering all broadcast slugs, plus an
//! in-memory registry of the viewer connections *this* process owns. One
//! published event reaches every viewer everywhere because every process
//! runs the same loop against its own registry; no process knows where
//! other viewers are connected.
//!
//! Connection resources are released through a single authority: the
//! connection's cancellation token. Registration is an RAII guard, so
//! normal close, error, forced stop, and process shutdown all converge on
//! the same deregistration path.

use simulcast_common::events::{ControlBus, ControlEvent, ControlKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One frame destined for a viewer's push stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Named SSE event with a JSON payload
    Named {
        event: &'static str,
        data: String,
    },
    /// Unnamed comment line; defeats idle-connection timeouts in proxies
    Comment(&'static str),
}

/// Per-connection sender half held in the registry
struct ViewerConnection {
    tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

struct Registry {
    /// slug -> connection id -> connection
    by_slug: HashMap<String, HashMap<Uuid, ViewerConnection>>,
    /// Shared heartbeat task; running iff at least one connection exists
    heartbeat: Option<JoinHandle<()>>,
    total: usize,
}

/// Fan-out hub for one worker process
pub struct FanoutHub {
    registry: Mutex<Registry>,
    heartbeat_interval: Duration,
    /// Delay between forwarding a `stopped` event and closing the
    /// connection, so the event actually flushes
    close_grace: Duration,
    /// Root token; child tokens are handed to each connection
    shutdown: CancellationToken,
}

/// Live registration for one viewer connection.
///
/// Dropping the guard deregisters the connection; the receiver yields the
/// frames the hub fans out.
pub struct ViewerRegistration {
    pub rx: mpsc::UnboundedReceiver<Frame>,
    pub cancel: CancellationToken,
    _guard: ConnectionGuard,
}

struct ConnectionGuard {
    hub: Arc<FanoutHub>,
    slug: String,
    id: Uuid,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.deregister(&self.slug, self.id);
    }
}

impl FanoutHub {
    /// Create the hub and spawn its shared bus subscription task.
    ///
    /// The subscription covers every slug; per-slug filtering happens
    /// against the local registry at dispatch time.
    pub fn start(bus: &ControlBus, heartbeat_interval: Duration, close_grace: Duration) -> Arc<Self> {
        let hub = Arc::new(Self {
            registry: Mutex::new(Registry {
                by_slug: HashMap::new(),
                heartbeat: None,
                total: 0,
            }),
            heartbeat_interval,
            close_grace,
            shutdown: CancellationToken::new(),
        });

        let mut rx = bus.subscribe();
        let listener = Arc::clone(&hub);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener.shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => listener.dispatch(event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Control bus subscription lagged, skipped {} events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Fan-out listener stopped");
        });

        hub
    }

    /// Register a new viewer connection for `slug`.
    ///
    /// Starts the shared heartbeat task if this is the first connection in
    /// the process.
    pub fn register(self: &Arc<Self>, slug: &str) -> ViewerRegistration {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let id = Uuid::new_v4();

        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .by_slug
                .entry(slug.to_string())
                .or_default()
                .insert(
                    id,
                    ViewerConnection {
                        tx,
                        cancel: cancel.clone(),
                    },
                );
            registry.total += 1;
            info!(
                "Viewer connected for '{}' ({} local connections)",
                slug, registry.total
            );
            self.ensure_heartbeat(&mut registry);
        }

        ViewerRegistration {
            rx,
            cancel,
            _guard: ConnectionGuard {
                hub: Arc::clone(self),
                slug: slug.to_string(),
                id,
            },
        }
    }

    /// Number of connections currently registered for `slug`
    pub fn connection_count(&self, slug: &str) -> usize {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.by_slug.get(slug).map_or(0, |c| c.len())
    }

    /// Total connections across all slugs in this process
    pub fn total_connections(&self) -> usize {
        self.registry.lock().expect("registry lock poisoned").total
    }

    /// Cancel the listener, the heartbeat, and every registered connection.
    ///
    /// Connections observe their child token and wind down; callers bound
    /// the wait themselves.
    pub fn shutdown(&self) {
        info!("Fan-out hub shutting down");
        self.shutdown.cancel();
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if let Some(handle) = registry.heartbeat.take() {
            handle.abort();
        }
    }

    /// Forward one event to the local connections registered for its slug.
    ///
    /// Remote viewers are some other process's responsibility via its own
    /// copy of the same subscription.
    fn dispatch(&self, event: ControlEvent) {
        let data = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize control event: {}", e);
                return;
            }
        };

        let mut to_close = Vec::new();
        {
            let registry = self.registry.lock().expect("registry lock poisoned");
            let Some(connections) = registry.by_slug.get(&event.slug) else {
                debug!("No local viewers for '{}', nothing to deliver", event.slug);
                return;
            };
            debug!(
                "Delivering '{}' to {} local viewers of '{}'",
                event.event_name(),
                connections.len(),
                event.slug
            );
            for connection in connections.values() {
                let _ = connection.tx.send(Frame::Named {
                    event: event.event_name(),
                    data: data.clone(),
                });
                if event.kind == ControlKind::Stopped {
                    to_close.push(connection.cancel.clone());
                }
            }
        }

        // A stopped broadcast owes its viewers nothing further: close each
        // connection after a bounded grace so the event can flush first.
        if !to_close.is_empty() {
            let grace = self.close_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                for cancel in to_close {
                    cancel.cancel();
                }
            });
        }
    }

    fn deregister(&self, slug: &str, id: Uuid) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let registry = &mut *registry;
        if let Some(connections) = registry.by_slug.get_mut(slug) {
            if connections.remove(&id).is_some() {
                registry.total -= 1;
            }
            if connections.is_empty() {
                registry.by_slug.remove(slug);
            }
        }
        info!(
            "Viewer disconnected from '{}' ({} local connections)",
            slug, registry.total
        );
        // No idle timers when nobody is listening
        if registry.total == 0 {
            if let Some(handle) = registry.heartbeat.take() {
                handle.abort();
                debug!("Heartbeat stopped, no local connections");
            }
        }
    }

    fn ensure_heartbeat(self: &Arc<Self>, registry: &mut Registry) {
        if registry.heartbeat.is_some() {
            return;
        }
        let hub = Arc::clone(self);
        registry.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so heartbeats are spaced
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.send_heartbeats();
            }
        }));
        debug!("Heartbeat started");
    }

    fn send_heartbeats(&self) {
        let registry = self.registry.lock().expect("registry lock poisoned");
        for connections in registry.by_slug.values() {
            for connection in connections.values() {
                let _ = connection.tx.send(Frame::Comment("keep-alive"));
            }
        }
    }
}
