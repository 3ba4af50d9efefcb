//! Notification pipeline.
//!
//! Events come in through [`EventIngest`], are expanded per recipient and
//! channel by the [`PreferenceResolver`], and land in the durable queue.
//! [`NotificationService`] runs one or more [`DispatchWorker`] loops per
//! channel that lease queued items, render them and hand them to the
//! channel's provider adapter.

pub mod channels;
pub mod dispatcher;
pub mod ingest;
pub mod preferences;
pub mod resolver;
pub mod service;
pub mod templates;

pub use channels::{ChannelDispatcher, DeliveryError, DispatchOutcome, ProviderAdapter};
pub use dispatcher::{BatchReport, DispatchWorker};
pub use ingest::{EventIngest, IngestReceipt};
pub use preferences::{PreferenceSource, StaticPreferenceSource};
pub use resolver::{PreferenceResolver, Resolution, SuppressionReason};
pub use service::NotificationService;
pub use templates::{BuiltinTemplates, Template, TemplateStore};
