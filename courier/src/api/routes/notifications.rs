//! Operator routes for queued notifications.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::{DeliveryRecordDbModel, NotificationStatusView, QueueStats};
use crate::notification::NotificationService;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(queue_stats))
        .route("/{id}", get(get_status))
        .route("/{id}/deliveries", get(get_deliveries))
        .route("/{id}/cancel", post(cancel))
        .route("/{id}/requeue", post(requeue))
}

fn service(state: &AppState) -> ApiResult<Arc<NotificationService>> {
    state
        .notification_service
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Notification service not available"))
}

async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(service(&state)?.stats().await?))
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NotificationStatusView>> {
    Ok(Json(service(&state)?.get_notification_status(&id).await?))
}

async fn get_deliveries(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DeliveryRecordDbModel>>> {
    let service = service(&state)?;
    // 404 for unknown ids rather than an empty list.
    service.get_notification_status(&id).await?;
    Ok(Json(service.delivery_history(&id).await?))
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NotificationStatusView>> {
    let service = service(&state)?;
    service.cancel(&id).await?;
    Ok(Json(service.get_notification_status(&id).await?))
}

async fn requeue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NotificationStatusView>> {
    let service = service(&state)?;
    service.requeue(&id).await?;
    Ok(Json(service.get_notification_status(&id).await?))
}
