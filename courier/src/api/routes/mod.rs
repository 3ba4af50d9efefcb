//! API route modules.
//!
//! Organizes routes by resource type.

pub mod events;
pub mod gateway;
pub mod health;
pub mod logging;
pub mod notifications;
pub mod presence;
pub mod users;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/events", events::router())
        .nest("/api/notifications", notifications::router())
        .nest("/api/users", users::router())
        .nest("/api/presence", presence::presence_router())
        .nest("/api/messages", presence::messages_router())
        .nest("/api/logging", logging::router())
        .nest("/health", health::router())
        .merge(gateway::router())
        .with_state(state)
}
