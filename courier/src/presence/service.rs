//! Connection lifecycle: `connecting → connected → disconnected`.
//!
//! The gateway calls [`PresenceService::on_connect`],
//! [`PresenceService::on_heartbeat`] and [`PresenceService::on_disconnect`];
//! a sweeper forces `disconnected` on connections that missed their
//! heartbeat window. `presence_changed` is published only when a user's
//! online state actually flips: by the caller that created the user's first
//! row or removed the last one. Lifecycle calls for one user run one at a
//! time so announcements leave this process in store order.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcaster::PresenceBroadcaster;
use super::events::PresenceEvent;
use super::registry::ConnectionRegistry;
use super::store::PresenceStore;
use crate::Result;
use crate::config::PresenceConfig;
use crate::database::models::PresenceConnectionDbModel;
use crate::database::time::offset_ms;
use crate::utils::SharedClock;
use crate::utils::keyed_lock::KeyedLock;

pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
    clock: SharedClock,
    config: PresenceConfig,
    users: KeyedLock,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<PresenceBroadcaster>,
        clock: SharedClock,
        config: PresenceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            broadcaster,
            clock,
            config,
            users: KeyedLock::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<PresenceBroadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// A transport session finished its handshake.
    ///
    /// Returns the connection's outbox; frames for it arrive there until the
    /// connection is disconnected or swept.
    pub async fn on_connect(
        &self,
        user: &str,
        connection_id: &str,
    ) -> Result<mpsc::Receiver<PresenceEvent>> {
        let _guard = self.users.lock(user).await;
        let now_ms = self.clock.now_ms();

        let outbox = self.registry.register(user, connection_id);
        let row = PresenceConnectionDbModel {
            connection_id: connection_id.to_string(),
            user_id: user.to_string(),
            node_id: self.config.node_id.clone(),
            connected_at: now_ms,
            last_seen_at: now_ms,
            expires_at: offset_ms(now_ms, self.config.entry_ttl()),
        };
        let first = match self.store.upsert(&row).await {
            Ok(first) => first,
            Err(e) => {
                self.registry.unregister(connection_id);
                return Err(e);
            }
        };

        if first {
            self.broadcaster
                .publish(PresenceEvent::presence_changed(user, true, now_ms));
        }
        info!(user, connection_id, "Connected");
        Ok(outbox)
    }

    /// Refresh a connection's TTL.
    ///
    /// Returns `false` when the connection is no longer known (already
    /// disconnected or swept); the gateway should then close the socket.
    pub async fn on_heartbeat(&self, connection_id: &str) -> Result<bool> {
        let now_ms = self.clock.now_ms();
        let expires_at = offset_ms(now_ms, self.config.entry_ttl());
        match self.store.touch(connection_id, now_ms, expires_at).await? {
            Some(_) => Ok(true),
            None => {
                debug!(connection_id, "Heartbeat for an unknown connection");
                self.registry.unregister(connection_id);
                Ok(false)
            }
        }
    }

    /// The transport closed. Idempotent.
    pub async fn on_disconnect(&self, connection_id: &str) -> Result<()> {
        let user = match self.registry.user_of(connection_id) {
            Some(user) => user,
            None => match self.store.owner_of(connection_id).await? {
                Some(user) => user,
                None => return Ok(()),
            },
        };
        let _guard = self.users.lock(&user).await;

        self.registry.unregister(connection_id);
        let Some(removal) = self.store.remove(connection_id).await? else {
            return Ok(());
        };
        if removal.last {
            self.broadcaster.publish(PresenceEvent::presence_changed(
                &removal.user_id,
                false,
                self.clock.now_ms(),
            ));
        }
        info!(user = %removal.user_id, connection_id, "Disconnected");
        Ok(())
    }

    /// Force `disconnected` on every connection past its TTL. Returns the
    /// users that went offline.
    ///
    /// Several nodes may sweep at once; each expired row is removed by
    /// exactly one of them.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let now_ms = self.clock.now_ms();
        let mut by_user: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in self.store.expired(now_ms).await? {
            by_user.entry(row.user_id).or_default().push(row.connection_id);
        }
        if by_user.is_empty() {
            return Ok(Vec::new());
        }

        let mut removed = 0usize;
        let mut offline = Vec::new();
        for (user, connections) in by_user {
            let _guard = self.users.lock(&user).await;
            let mut went_offline = false;
            for connection_id in connections {
                let Some(removal) = self.store.remove_expired(&connection_id, now_ms).await? else {
                    continue;
                };
                self.registry.unregister(&connection_id);
                removed += 1;
                went_offline |= removal.last;
            }
            if went_offline {
                self.broadcaster
                    .publish(PresenceEvent::presence_changed(&user, false, now_ms));
                offline.push(user);
            }
        }
        if removed > 0 {
            info!(expired = removed, offline = offline.len(), "Swept stale connections");
        }
        Ok(offline)
    }

    pub async fn is_online(&self, user: &str) -> Result<bool> {
        self.store.is_online(user, self.clock.now_ms()).await
    }

    pub async fn online_users(&self) -> Result<Vec<String>> {
        self.store.online_users(self.clock.now_ms()).await
    }

    /// Subscribe `connection_id` to `target`'s presence and send it the
    /// current state right away.
    pub async fn watch(&self, connection_id: &str, target: &str) -> Result<bool> {
        if !self.registry.watch(connection_id, target) {
            return Ok(false);
        }
        let now_ms = self.clock.now_ms();
        let online = self.store.is_online(target, now_ms).await?;
        self.registry.send_to_connection(
            connection_id,
            PresenceEvent::presence_changed(target, online, now_ms),
        );
        Ok(true)
    }

    pub fn unwatch(&self, connection_id: &str, target: &str) {
        self.registry.unwatch(connection_id, target);
    }

    /// Forget rows this node left behind in a previous run.
    pub async fn reset_node(&self) -> Result<u64> {
        let removed = self.store.clear_node(&self.config.node_id).await?;
        if removed > 0 {
            info!(removed, node_id = %self.config.node_id, "Cleared stale presence rows");
        }
        Ok(removed)
    }

    /// Run [`Self::sweep`] every sweep interval until cancelled.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = this.sweep().await {
                            warn!(error = %e, "Presence sweep failed");
                        }
                    }
                }
            }
            debug!("Presence sweeper stopped");
        })
    }
}
