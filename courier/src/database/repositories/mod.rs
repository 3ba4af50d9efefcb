//! Repository layer for database access.
//!
//! Each repository owns one concern of the pipeline; multi-table writes that
//! must commit together live in [`IngestTxOps`].

pub mod contact;
pub mod event;
pub mod ingest_tx;
pub mod ledger;
pub mod notification;
pub mod preference;
pub mod presence;
pub mod template;

pub use contact::SqlxRecipientDirectory;
pub use event::{EventRepository, SqlxEventRepository};
pub use ingest_tx::IngestTxOps;
pub use ledger::{DeliveryLedger, SqlxDeliveryLedger};
pub use notification::{NotificationRepository, SqlxNotificationRepository};
pub use preference::SqlxPreferenceRepository;
pub use presence::SqlxPresenceStore;
pub use template::SqlxTemplateRepository;
