//! Event ingest route.

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::NewEvent;
use crate::notification::IngestReceipt;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(ingest_event))
}

/// `202 Accepted` with the receipt; `200` when the id was already ingested.
async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<NewEvent>,
) -> ApiResult<(StatusCode, Json<IngestReceipt>)> {
    let ingest = state
        .ingest
        .ok_or_else(|| ApiError::service_unavailable("Event ingest not available"))?;

    let receipt = ingest.ingest(event).await?;
    let status = if receipt.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(receipt)))
}
