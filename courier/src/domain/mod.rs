//! Domain layer for courier.
//!
//! Events, triggers, preferences and the value objects they are built from.

pub mod event;
pub mod preference;
pub mod trigger;
pub mod value_objects;

pub use event::{Event, NewEvent};
pub use preference::NotificationPreference;
pub use trigger::TriggerType;
pub use value_objects::*;
