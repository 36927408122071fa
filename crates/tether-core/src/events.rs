//! Typed events flowing from the sync managers to the orchestrator.
//!
//! Managers emit onto an unbounded channel synchronously inside their tick;
//! the orchestrator drains it on its own tick. Sends never block and a
//! dropped receiver is not an error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{CommandType, EndpointRole, InboundCommand, Priority};

/// Why an update left the dashboard queue without being synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Removed to make room on overflow.
    Evicted,
    /// Part of too many failed batches.
    RetriesExhausted,
}

/// Event emitted by a sync manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    AiConnectivityChanged {
        online: bool,
    },
    CommandCompleted {
        id: Uuid,
        command_type: CommandType,
        response: serde_json::Value,
    },
    /// A retryable attempt failed; the command stays pending.
    CommandAttemptFailed {
        id: Uuid,
        command_type: CommandType,
        attempt: u32,
        error: String,
    },
    /// Terminal failure after exhausting retries.
    CommandFailed {
        id: Uuid,
        command_type: CommandType,
        priority: Priority,
        attempts: u32,
        error: String,
    },
    QuotaExceeded {
        used: u32,
        limit: u32,
        resets_at: DateTime<Utc>,
    },
    EndpointConnected {
        url: String,
        role: EndpointRole,
    },
    EndpointLost {
        url: String,
        role: EndpointRole,
    },
    DashboardOffline,
    SyncComplete {
        synced: usize,
        endpoint: String,
    },
    SyncFailed {
        batch: usize,
        error: String,
    },
    UpdateDropped {
        id: Uuid,
        priority: Priority,
        reason: DropReason,
    },
    InboundCommand(InboundCommand),
}

impl SyncEvent {
    /// Short name used for logs and metrics keys.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::AiConnectivityChanged { .. } => "ai_connectivity_changed",
            SyncEvent::CommandCompleted { .. } => "command_completed",
            SyncEvent::CommandAttemptFailed { .. } => "command_attempt_failed",
            SyncEvent::CommandFailed { .. } => "command_failed",
            SyncEvent::QuotaExceeded { .. } => "quota_exceeded",
            SyncEvent::EndpointConnected { .. } => "endpoint_connected",
            SyncEvent::EndpointLost { .. } => "endpoint_lost",
            SyncEvent::DashboardOffline => "dashboard_offline",
            SyncEvent::SyncComplete { .. } => "sync_complete",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::UpdateDropped { .. } => "update_dropped",
            SyncEvent::InboundCommand(_) => "inbound_command",
        }
    }
}

/// Sending half handed to each manager.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sender that discards everything (managers used standalone).
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<SyncEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender::new(tx), rx)
}

/// Drain everything currently buffered without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_drain_in_order() {
        let (sender, mut rx) = channel();
        sender.emit(SyncEvent::DashboardOffline);
        sender.emit(SyncEvent::AiConnectivityChanged { online: true });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "dashboard_offline");
        assert_eq!(events[1], SyncEvent::AiConnectivityChanged { online: true });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_emit_without_receiver_is_silent() {
        let (sender, rx) = channel();
        drop(rx);
        sender.emit(SyncEvent::DashboardOffline);
        EventSender::disconnected().emit(SyncEvent::DashboardOffline);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let value = serde_json::to_value(SyncEvent::SyncComplete {
            synced: 3,
            endpoint: "https://a".into(),
        })
        .unwrap();
        assert_eq!(value["event"], "sync_complete");
        assert_eq!(value["synced"], 3);
    }
}
