//! HTTP API: event ingest, operator tooling, user settings, presence
//! queries and the WebSocket gateway.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
