//! Notification service: owns the channel workers and the operator surface
//! (status, cancel, requeue, stats).

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::channels::ChannelDispatcher;
use super::dispatcher::DispatchWorker;
use super::templates::TemplateStore;
use crate::Result;
use crate::config::DispatchConfig;
use crate::database::models::{DeliveryRecordDbModel, NotificationStatusView, QueueStats};
use crate::database::repositories::{DeliveryLedger, NotificationRepository};
use crate::domain::Channel;
use crate::utils::SharedClock;

pub struct NotificationService {
    queue: Arc<dyn NotificationRepository>,
    ledger: Arc<dyn DeliveryLedger>,
    templates: Arc<dyn TemplateStore>,
    clock: SharedClock,
    config: DispatchConfig,
    dispatchers: RwLock<Vec<Arc<ChannelDispatcher>>>,
    workers: Mutex<JoinSet<()>>,
    cancellation_token: CancellationToken,
}

impl NotificationService {
    pub fn new(
        queue: Arc<dyn NotificationRepository>,
        ledger: Arc<dyn DeliveryLedger>,
        templates: Arc<dyn TemplateStore>,
        clock: SharedClock,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            ledger,
            templates,
            clock,
            config,
            dispatchers: RwLock::new(Vec::new()),
            workers: Mutex::new(JoinSet::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Register a channel. One dispatcher per channel; a second
    /// registration for the same channel replaces the first.
    pub fn register(&self, dispatcher: ChannelDispatcher) {
        let mut dispatchers = self.dispatchers.write();
        dispatchers.retain(|d| d.channel() != dispatcher.channel());
        info!(
            channel = %dispatcher.channel(),
            provider = dispatcher.provider_name(),
            "Channel registered"
        );
        dispatchers.push(Arc::new(dispatcher));
    }

    pub fn enabled_channels(&self) -> Vec<Channel> {
        self.dispatchers.read().iter().map(|d| d.channel()).collect()
    }

    /// Spawn `workers_per_channel` worker loops for every registered channel.
    pub async fn start(&self) {
        let dispatchers = self.dispatchers.read().clone();
        if dispatchers.is_empty() {
            warn!("No delivery channels configured; notifications will stay queued");
        }

        let mut workers = self.workers.lock().await;
        for dispatcher in dispatchers {
            for index in 0..self.config.workers_per_channel.max(1) {
                let worker = DispatchWorker::new(
                    index,
                    dispatcher.clone(),
                    self.queue.clone(),
                    self.ledger.clone(),
                    self.templates.clone(),
                    self.clock.clone(),
                    &self.config,
                );
                workers.spawn(worker.run(self.cancellation_token.child_token()));
            }
        }
        info!(workers = workers.len(), "Notification service started");
    }

    /// Stop leasing and wait up to the drain timeout for in-flight batches.
    ///
    /// Workers still running after that are aborted; their leases lapse and
    /// the items become visible to the next process.
    pub async fn shutdown(&self) {
        info!("Stopping notification service");
        self.cancellation_token.cancel();

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(self.config.drain_timeout(), async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result
                    && e.is_panic()
                {
                    warn!(error = %e, "Dispatch worker panicked");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = workers.len(),
                "Drain timeout reached, aborting dispatch workers"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        info!("Notification service stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn get_notification_status(&self, id: &str) -> Result<NotificationStatusView> {
        self.queue.get_status(id).await
    }

    /// Cancel a notification that has not been leased yet.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.queue.cancel(id, self.clock.now_ms()).await?;
        info!(notification_id = %id, "Notification cancelled");
        Ok(())
    }

    /// Put a failed, expired or cancelled notification back in the queue
    /// with a fresh attempt budget.
    pub async fn requeue(&self, id: &str) -> Result<()> {
        self.queue.requeue(id, self.clock.now_ms()).await?;
        info!(notification_id = %id, "Notification requeued");
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    pub async fn delivery_history(&self, id: &str) -> Result<Vec<DeliveryRecordDbModel>> {
        self.ledger.list_for_notification(id).await
    }

    /// Most recent ledger entries for a user, newest first.
    pub async fn recipient_history(
        &self,
        user: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryRecordDbModel>> {
        self.ledger.list_for_recipient(user, limit).await
    }
}
