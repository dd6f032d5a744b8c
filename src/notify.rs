//! Best-effort notification channel
//!
//! Registration, demotion, and settlement events are broadcast to active
//! nodes. Delivery is best-effort by contract: a failed broadcast is logged
//! for audit and swallowed, never propagated as a request-level error.

use crate::types::MeshEvent;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Best-effort event broadcast to active nodes
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Deliver an event. Errors are reported so the caller can log them, but
    /// callers must treat every failure as non-fatal.
    async fn broadcast(&self, event: MeshEvent) -> Result<(), String>;
}

/// Fire an event and swallow any delivery failure
pub async fn notify_best_effort(channel: &dyn NotificationChannel, event: MeshEvent) {
    if let Err(detail) = channel.broadcast(event).await {
        warn!(detail, "Notification broadcast failed; continuing");
    }
}

/// Channel that drops every event; useful in tests and embedded setups
pub struct NullNotifier;

#[async_trait]
impl NotificationChannel for NullNotifier {
    async fn broadcast(&self, event: MeshEvent) -> Result<(), String> {
        debug!(?event, "Event dropped by null notifier");
        Ok(())
    }
}

/// In-process notifier backed by a tokio broadcast channel. Real deployments
/// bridge the receiver onto whatever transport reaches their nodes.
pub struct ChannelNotifier {
    sender: broadcast::Sender<MeshEvent>,
}

impl ChannelNotifier {
    /// Create a notifier with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationChannel for ChannelNotifier {
    async fn broadcast(&self, event: MeshEvent) -> Result<(), String> {
        // send fails only when no receiver is subscribed, which is fine for
        // a best-effort channel
        match self.sender.send(event) {
            Ok(_) => Ok(()),
            Err(_) => Err("no subscribers".to_string()),
        }
    }
}
