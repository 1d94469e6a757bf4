//! Notification collaborator, called fire-and-forget after graph mutations.

use serde::Serialize;

use crate::error::Result;
use crate::requests::ConnectionRequest;
use crate::store::RelationshipEdge;

/// Graph changes other parties may want to hear about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    ConnectionRequested { request: ConnectionRequest },
    ConnectionApproved { request: ConnectionRequest, edges: Vec<RelationshipEdge> },
    ConnectionDeclined { request: ConnectionRequest },
}

impl GraphEvent {
    /// Profile that should be told about the event.
    pub fn recipient(&self) -> &str {
        match self {
            GraphEvent::ConnectionRequested { request } => &request.receiver_id,
            GraphEvent::ConnectionApproved { request, .. }
            | GraphEvent::ConnectionDeclined { request } => &request.sender_id,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &GraphEvent) -> Result<()>;
}

/// Writes events to the log; the default when no delivery channel is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &GraphEvent) -> Result<()> {
        log::info!("Notify {}: {}", event.recipient(), serde_json::to_string(event)?);
        Ok(())
    }
}

/// Deliver `event`, logging instead of propagating a delivery failure.
pub fn dispatch(notifier: &dyn Notifier, event: GraphEvent) {
    if let Err(e) = notifier.notify(&event) {
        log::warn!("Notification to {} failed: {}", event.recipient(), e);
    }
}
