//! Service container for dependency injection.
//!
//! The ServiceContainer wires repositories, the notification pipeline and
//! presence together over one database pool and manages their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::api::AppState;
use crate::config::AppConfig;
use crate::database::models::QueueStats;
use crate::database::repositories::{
    DeliveryLedger, NotificationRepository, SqlxDeliveryLedger, SqlxEventRepository,
    SqlxNotificationRepository, SqlxPreferenceRepository, SqlxPresenceStore,
    SqlxRecipientDirectory, SqlxTemplateRepository,
};
use crate::database::{DbPool, MaintenanceScheduler};
use crate::domain::Channel;
use crate::notification::channels::{
    EmailDispatcher, HttpEmailProvider, HttpSmsProvider, PushDispatcher, RecipientDirectory,
    SmsDispatcher, SpendGuard, WebPushProvider,
};
use crate::notification::{ChannelDispatcher, EventIngest, NotificationService, PreferenceResolver};
use crate::presence::{ConnectionRegistry, DirectMessenger, PresenceBroadcaster, PresenceService};
use crate::utils::SharedClock;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ServiceContainer {
    pub pool: DbPool,
    pub clock: SharedClock,
    pub ingest: Arc<EventIngest>,
    pub notification_service: Arc<NotificationService>,
    pub presence_service: Arc<PresenceService>,
    pub messenger: Arc<DirectMessenger>,
    pub preferences: Arc<SqlxPreferenceRepository>,
    pub directory: Arc<SqlxRecipientDirectory>,
    pub maintenance: Arc<MaintenanceScheduler>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build every service. Channels without provider configuration are
    /// left unregistered; their notifications wait in the queue.
    pub fn new(pool: DbPool, config: &AppConfig, clock: SharedClock) -> Result<Self> {
        let queue: Arc<dyn NotificationRepository> =
            Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let ledger: Arc<dyn DeliveryLedger> = Arc::new(SqlxDeliveryLedger::new(pool.clone()));
        let preferences = Arc::new(SqlxPreferenceRepository::new(pool.clone()));
        let directory = Arc::new(SqlxRecipientDirectory::new(pool.clone()));
        let templates = Arc::new(SqlxTemplateRepository::new(pool.clone()));

        let resolver = Arc::new(PreferenceResolver::new(
            preferences.clone(),
            queue.clone(),
            config.resolver.clone(),
            config.dispatch.retry.clone(),
        ));
        let ingest = Arc::new(EventIngest::new(pool.clone(), resolver, clock.clone()));

        let notification_service = Arc::new(NotificationService::new(
            queue.clone(),
            ledger.clone(),
            templates,
            clock.clone(),
            config.dispatch.clone(),
        ));
        for dispatcher in build_dispatchers(config, directory.clone(), ledger.clone()) {
            notification_service.register(dispatcher);
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(PresenceBroadcaster::with_capacity(
            registry.clone(),
            config.presence.broadcast_capacity,
        ));
        let presence_service = Arc::new(PresenceService::new(
            Arc::new(SqlxPresenceStore::new(pool.clone())),
            registry.clone(),
            broadcaster.clone(),
            clock.clone(),
            config.presence.clone(),
        ));
        let messenger = Arc::new(DirectMessenger::new(
            registry,
            broadcaster,
            ingest.clone(),
            clock.clone(),
        ));

        let maintenance = Arc::new(MaintenanceScheduler::new(
            queue,
            ledger,
            Arc::new(SqlxEventRepository::new(pool.clone())),
            clock.clone(),
            config.maintenance.clone(),
        ));

        Ok(Self {
            pool,
            clock,
            ingest,
            notification_service,
            presence_service,
            messenger,
            preferences,
            directory,
            maintenance,
            background: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start background work: presence fan-out and sweeping, maintenance and
    /// the channel workers.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        // Rows from a previous run of this node are dead sockets.
        self.presence_service.reset_node().await?;

        let mut background = self.background.lock().await;
        background.push(
            self.presence_service
                .broadcaster()
                .start(self.cancellation_token.child_token()),
        );
        background.push(
            self.presence_service
                .start_sweeper(self.cancellation_token.child_token()),
        );
        background.push(self.maintenance.clone().start());
        drop(background);

        self.notification_service.start().await;

        let channels = self.notification_service.enabled_channels();
        if channels.is_empty() {
            warn!("No delivery providers configured; notifications will stay queued");
        }
        info!(channels = ?channels, "Services initialized");
        Ok(())
    }

    /// State handed to the HTTP API.
    pub fn app_state(&self) -> AppState {
        AppState::new()
            .with_clock(self.clock.clone())
            .with_pool(self.pool.clone())
            .with_ingest(self.ingest.clone())
            .with_notification_service(self.notification_service.clone())
            .with_presence(self.presence_service.clone(), self.messenger.clone())
            .with_user_settings(self.preferences.clone(), self.directory.clone())
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        self.cancellation_token.cancel();
        self.maintenance.stop();

        // Workers drain their in-flight batch under the dispatch drain timeout.
        self.notification_service.shutdown().await;

        let background: Vec<_> = std::mem::take(&mut *self.background.lock().await);
        let shutdown_result = tokio::time::timeout(timeout, async {
            for handle in background {
                if !handle.is_finished() {
                    handle.abort();
                }
                let _ = handle.await;
            }
        })
        .await;

        if shutdown_result.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        Ok(ServiceStats {
            queue: self.notification_service.stats().await?,
            channels: self.notification_service.enabled_channels(),
            local_connections: self.presence_service.registry().len(),
            broadcast_subscribers: self.presence_service.broadcaster().subscriber_count(),
        })
    }
}

/// One dispatcher per channel whose provider is configured.
fn build_dispatchers(
    config: &AppConfig,
    directory: Arc<SqlxRecipientDirectory>,
    ledger: Arc<dyn DeliveryLedger>,
) -> Vec<ChannelDispatcher> {
    let directory: Arc<dyn RecipientDirectory> = directory;
    let timeout = config.dispatch.provider_timeout();
    let mut dispatchers = Vec::new();

    match &config.providers.email {
        Some(email) => dispatchers.push(ChannelDispatcher::Email(EmailDispatcher::new(
            Arc::new(HttpEmailProvider::new(email.clone())),
            directory.clone(),
            timeout,
        ))),
        None => info!(channel = %Channel::Email, "Provider not configured, channel disabled"),
    }

    match &config.providers.sms {
        Some(sms) => {
            let spend = Arc::new(SpendGuard::new(ledger, config.sms.daily_spend_ceiling));
            dispatchers.push(ChannelDispatcher::Sms(SmsDispatcher::new(
                Arc::new(HttpSmsProvider::new(sms.clone())),
                directory.clone(),
                spend,
                config.sms.cost_per_message,
                timeout,
            )));
        }
        None => info!(channel = %Channel::Sms, "Provider not configured, channel disabled"),
    }

    match &config.providers.web_push {
        Some(push) => dispatchers.push(ChannelDispatcher::Push(PushDispatcher::new(
            Arc::new(WebPushProvider::new(push.clone(), timeout)),
            directory,
            timeout,
        ))),
        None => info!(channel = %Channel::Push, "Provider not configured, channel disabled"),
    }

    dispatchers
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStats {
    pub queue: QueueStats,
    pub channels: Vec<Channel>,
    /// Sockets held by this process.
    pub local_connections: usize,
    pub broadcast_subscribers: usize,
}
