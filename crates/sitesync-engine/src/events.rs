//! Outbound sync events.
//!
//! Events are published on a tokio broadcast channel. Delivery is
//! at-least-once from a consumer's point of view: a change may be re-emitted
//! after a retried run, so consumers dedupe with
//! [`ChangeRecord::dedup_key`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use sitesync_connector::classify::Severity;
use sitesync_connector::ids::SystemId;

use crate::change::ChangeRecord;
use crate::ids::RunId;
use crate::run::SyncRun;

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A run recorded a critical-severity error.
    CriticalError,
    /// A breaker kept reopening without ever closing.
    CircuitRepeatedlyOpen,
}

/// Operator alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            system: None,
            run_id: None,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: SystemId) -> Self {
        self.system = Some(system);
        self
    }

    #[must_use]
    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// An event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A field change at or above the notification threshold.
    Change { change: ChangeRecord },
    /// A run reached a terminal status.
    RunCompleted { run: SyncRun },
    /// A dependency's circuit breaker opened.
    CircuitOpened {
        dependency: String,
        consecutive_failures: u32,
    },
    Alert { alert: Alert },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::Change { .. } => "change",
            SyncEvent::RunCompleted { .. } => "run_completed",
            SyncEvent::CircuitOpened { .. } => "circuit_opened",
            SyncEvent::Alert { .. } => "alert",
        }
    }
}

/// Destination for sync events.
pub trait EventSink: Send + Sync {
    /// Publish an event. Never blocks and never fails the caller.
    fn publish(&self, event: SyncEvent);
}

/// Event sink backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: SyncEvent) {
        let event_type = event.event_type();
        if self.sender.send(event).is_err() {
            debug!(event_type, "No subscribers for sync event");
        }
    }
}
