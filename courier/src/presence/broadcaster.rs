//! Presence broadcaster: publish/subscribe fan-out to local connections.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::PresenceEvent;
use super::registry::ConnectionRegistry;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct PresenceBroadcaster {
    sender: broadcast::Sender<PresenceEvent>,
    registry: Arc<ConnectionRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<ConnectionRegistry>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, registry }
    }

    /// Publish an event. Returns the number of subscribers that saw it.
    pub fn publish(&self, event: PresenceEvent) -> usize {
        debug!(kind = event.kind(), "Publishing presence event");
        // No subscribers is not an error.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Route one event to the local connections interested in it.
    pub fn fan_out(&self, event: &PresenceEvent) -> usize {
        match event {
            PresenceEvent::PresenceChanged { user, .. } => self
                .registry
                .watchers_of(user)
                .iter()
                .filter(|conn| self.registry.send_to_connection(conn, event.clone()))
                .count(),
            PresenceEvent::DirectMessage { to, .. } => self.registry.send_to_user(to, event),
            PresenceEvent::MessageDelivered { from, .. } => {
                self.registry.send_to_user(from, event)
            }
        }
    }

    /// Spawn the fan-out loop. The subscription is taken before this returns,
    /// so nothing published afterwards is missed.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!("Presence broadcaster started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            this.fan_out(&event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Presence broadcaster lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("Presence broadcaster stopped");
        })
    }
}
