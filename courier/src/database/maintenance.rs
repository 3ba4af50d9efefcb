//! Periodic queue and ledger maintenance.
//!
//! - Expire pending notifications past their TTL
//! - Fail leases that lapsed with no attempts left
//! - Prune old ledger rows and settled events inside the maintenance window

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::Mutex;

use crate::config::{env_parse, env_string};
use crate::database::repositories::{DeliveryLedger, EventRepository, NotificationRepository};
use crate::database::time::datetime_to_ms;
use crate::utils::SharedClock;
use crate::{Error, Result};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between queue sweeps.
    pub sweep_interval: Duration,
    /// Start of the pruning window, UTC.
    pub window_start: NaiveTime,
    /// End of the pruning window, UTC.
    pub window_end: NaiveTime,
    pub ledger_retention_days: u32,
    pub event_retention_days: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            window_start: NaiveTime::MIN,
            window_end: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or(NaiveTime::MIN),
            ledger_retention_days: 90,
            event_retention_days: 30,
        }
    }
}

impl MaintenanceConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(secs) = env_parse::<u64>("COURIER_MAINTENANCE_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(v) = env_string("COURIER_MAINTENANCE_WINDOW") {
            let (start, end) = parse_window(&v).ok_or_else(|| {
                Error::config(format!("Invalid COURIER_MAINTENANCE_WINDOW (want HH:MM-HH:MM): {v}"))
            })?;
            config.window_start = start;
            config.window_end = end;
        }
        if let Some(v) = env_parse("COURIER_LEDGER_RETENTION_DAYS")? {
            config.ledger_retention_days = v;
        }
        if let Some(v) = env_parse("COURIER_EVENT_RETENTION_DAYS")? {
            config.event_retention_days = v;
        }
        Ok(config)
    }

    /// Whether `now` falls inside the pruning window. Windows may wrap
    /// midnight (e.g. 22:00-02:00).
    pub fn in_window(&self, now: NaiveTime) -> bool {
        if self.window_start <= self.window_end {
            now >= self.window_start && now <= self.window_end
        } else {
            now >= self.window_start || now <= self.window_end
        }
    }
}

fn parse_window(value: &str) -> Option<(NaiveTime, NaiveTime)> {
    let (start, end) = value.split_once('-')?;
    let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
    Some((start, end))
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: u64,
    pub exhausted: u64,
    pub ledger_pruned: u64,
    pub events_pruned: u64,
}

pub struct MaintenanceScheduler {
    queue: Arc<dyn NotificationRepository>,
    ledger: Arc<dyn DeliveryLedger>,
    events: Arc<dyn EventRepository>,
    clock: SharedClock,
    config: MaintenanceConfig,
    running: Arc<AtomicBool>,
    last_prune: Mutex<Option<DateTime<Utc>>>,
}

impl MaintenanceScheduler {
    pub fn new(
        queue: Arc<dyn NotificationRepository>,
        ledger: Arc<dyn DeliveryLedger>,
        events: Arc<dyn EventRepository>,
        clock: SharedClock,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            queue,
            ledger,
            events,
            clock,
            config,
            running: Arc::new(AtomicBool::new(false)),
            last_prune: Mutex::new(None),
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.running.store(true, Ordering::SeqCst);
            scheduler.run_loop().await;
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.run_maintenance().await {
                tracing::error!(error = %e, "Maintenance error");
            }
        }
        tracing::debug!("Maintenance scheduler stopped");
    }

    /// Run one pass: always sweep the queue; prune at most once a day while
    /// inside the window.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = self.clock.now();
        let now_ms = datetime_to_ms(now);
        let mut report = MaintenanceReport {
            expired: self.queue.expire_stale(now_ms).await?,
            exhausted: self.queue.fail_exhausted_leases(now_ms).await?,
            ..Default::default()
        };

        if self.config.in_window(now.time()) && self.prune_due(now).await {
            let ledger_cutoff = now - chrono::Duration::days(i64::from(self.config.ledger_retention_days));
            let event_cutoff = now - chrono::Duration::days(i64::from(self.config.event_retention_days));
            report.ledger_pruned = self.ledger.prune_before(datetime_to_ms(ledger_cutoff)).await?;
            report.events_pruned = self.events.prune_before(datetime_to_ms(event_cutoff)).await?;
            *self.last_prune.lock().await = Some(now);
        }

        if report != MaintenanceReport::default() {
            tracing::info!(
                expired = report.expired,
                exhausted = report.exhausted,
                ledger_pruned = report.ledger_pruned,
                events_pruned = report.events_pruned,
                "Maintenance pass completed"
            );
        }
        Ok(report)
    }

    async fn prune_due(&self, now: DateTime<Utc>) -> bool {
        match *self.last_prune.lock().await {
            Some(last) => now.signed_duration_since(last) >= chrono::Duration::hours(20),
            None => true,
        }
    }
}
