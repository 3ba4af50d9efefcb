//! Database models for courier.
//!
//! These map directly onto the schema; JSON columns are stored as TEXT and
//! decoded by the owning model.

pub mod delivery;
pub mod event;
pub mod notification;
pub mod presence;
pub mod settings;

pub use delivery::*;
pub use event::*;
pub use notification::*;
pub use presence::*;
pub use settings::*;
