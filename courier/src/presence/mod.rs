//! Real-time presence.
//!
//! [`PresenceStore`] is the cross-process record of live connections,
//! [`ConnectionRegistry`] indexes the sockets held by this process, and
//! [`PresenceBroadcaster`] fans published events out to them.
//! [`PresenceService`] drives the per-connection state machine and
//! [`DirectMessenger`] delivers direct messages with a push fallback.

pub mod broadcaster;
pub mod events;
pub mod messaging;
pub mod registry;
pub mod service;
pub mod store;

pub use broadcaster::PresenceBroadcaster;
pub use events::{ClientFrame, PresenceEvent};
pub use messaging::{DirectMessenger, MessageOutcome};
pub use registry::ConnectionRegistry;
pub use service::PresenceService;
pub use store::{MemoryPresenceStore, PresenceStore, Removal};
