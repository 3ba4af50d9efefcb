//! courier library crate.
//!
//! Multi-channel notification dispatch (email, SMS, push) driven by domain
//! events, plus real-time presence and direct messaging over WebSockets.
//! The `courier` binary wires these together; the library is exposed for
//! embedding and integration testing.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notification;
pub mod presence;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
