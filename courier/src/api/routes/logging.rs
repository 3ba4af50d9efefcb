//! Runtime log filter.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::LogFilterBody;
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/filter", get(get_filter).put(set_filter))
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterBody>> {
    let logging = state
        .logging_config
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration not available"))?;
    Ok(Json(LogFilterBody {
        filter: logging.get_filter(),
    }))
}

/// Replace the filter, e.g. `{"filter": "courier=debug,sqlx=warn"}`.
async fn set_filter(
    State(state): State<AppState>,
    Json(body): Json<LogFilterBody>,
) -> ApiResult<Json<LogFilterBody>> {
    let logging = state
        .logging_config
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration not available"))?;
    logging.set_filter(&body.filter)?;
    Ok(Json(LogFilterBody {
        filter: logging.get_filter(),
    }))
}
