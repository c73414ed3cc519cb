//! Control events and the control bus
//!
//! A `ControlEvent` transits the bus exactly once: the mutation handler
//! persists the force-stop flag first, then publishes. Events are never
//! stored; a viewer connecting later learns the truth from the durable
//! status check at connect time, not from event replay.
//!
//! The bus is the cross-process seam: worker code only sees
//! `publish`/`subscribe`. Each worker process holds exactly one
//! subscription covering all broadcast slugs, so subscription count is
//! bounded by process count rather than viewer or broadcast count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of control event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Stopped,
    Resumed,
}

/// A transient stop/resume notification for one broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub kind: ControlKind,
    pub slug: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ControlEvent {
    pub fn stopped(slug: impl Into<String>) -> Self {
        Self {
            kind: ControlKind::Stopped,
            slug: slug.into(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn resumed(slug: impl Into<String>) -> Self {
        Self {
            kind: ControlKind::Resumed,
            slug: slug.into(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    /// SSE event name for this kind
    pub fn event_name(&self) -> &'static str {
        match self.kind {
            ControlKind::Stopped => "stopped",
            ControlKind::Resumed => "resumed",
        }
    }
}

/// Publish/subscribe channel for control events.
///
/// Backed by `tokio::sync::broadcast`: non-blocking publish, multiple
/// concurrent subscribers, automatic cleanup when subscribers drop, lagged
/// detection for slow subscribers. If no subscriber is listening at
/// publish time the event is simply not observed; that is by contract, not
/// an error (durable state carries the truth for late joiners).
#[derive(Clone)]
pub struct ControlBus {
    tx: broadcast::Sender<ControlEvent>,
    capacity: usize,
}

impl ControlBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future control events, for every slug
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    /// Publish one event to all current subscribers
    #[allow(clippy::result_large_err)]
    pub fn publish(
        &self,
        event: ControlEvent,
    ) -> Result<usize, broadcast::error::SendError<ControlEvent>> {
        self.tx.send(event)
    }

    /// Publish, ignoring the case where nobody is subscribed
    pub fn publish_lossy(&self, event: ControlEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
