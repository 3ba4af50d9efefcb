//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::models::{ComponentHealth, HealthResponse};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

async fn check_components(state: &AppState) -> Vec<ComponentHealth> {
    let mut components = Vec::new();

    if let Some(pool) = &state.pool {
        components.push(match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => ComponentHealth::healthy("database"),
            Err(e) => ComponentHealth::unhealthy("database", e.to_string()),
        });
    }

    if let Some(service) = &state.notification_service {
        components.push(if service.is_shutting_down() {
            ComponentHealth::unhealthy("dispatch", "shutting down")
        } else {
            ComponentHealth::healthy("dispatch")
        });
    }

    if state.presence_service.is_some() {
        components.push(ComponentHealth::healthy("presence"));
    }

    components
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let components = check_components(&state).await;
    let status = if components.iter().all(ComponentHealth::is_healthy) {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        components,
    })
}

/// 200 when every component is healthy, 503 otherwise.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if check_components(&state)
        .await
        .iter()
        .all(ComponentHealth::is_healthy)
    {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;

    #[tokio::test]
    async fn test_database_component_reported() {
        let pool = init_memory_pool().await.unwrap();
        let state = AppState::new().with_pool(pool);
        let components = check_components(&state).await;
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "database");
        assert!(components[0].is_healthy());
    }

    #[tokio::test]
    async fn test_closed_pool_is_unhealthy() {
        let pool = init_memory_pool().await.unwrap();
        pool.close().await;
        let state = AppState::new().with_pool(pool);
        let Json(health) = health_check(State(state)).await;
        assert_eq!(health.status, "degraded");
    }
}
