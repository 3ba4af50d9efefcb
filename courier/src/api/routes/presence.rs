//! Presence queries and direct messages.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{OnlineUsersResponse, SendMessageRequest, UserPresenceResponse};
use crate::api::server::AppState;
use crate::presence::{MessageOutcome, PresenceService};

/// Longest accepted message body, in characters.
const MAX_MESSAGE_CHARS: usize = 4000;

pub fn presence_router() -> Router<AppState> {
    Router::new()
        .route("/online", get(online_users))
        .route("/{user}", get(user_presence))
}

pub fn messages_router() -> Router<AppState> {
    Router::new().route("/", post(send_message))
}

fn presence(state: &AppState) -> ApiResult<Arc<PresenceService>> {
    state
        .presence_service
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Presence not available"))
}

async fn online_users(State(state): State<AppState>) -> ApiResult<Json<OnlineUsersResponse>> {
    let presence = presence(&state)?;
    Ok(Json(OnlineUsersResponse {
        users: presence.online_users().await?,
        local_connections: presence.registry().len(),
    }))
}

async fn user_presence(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> ApiResult<Json<UserPresenceResponse>> {
    let online = presence(&state)?.is_online(&user).await?;
    Ok(Json(UserPresenceResponse { user, online }))
}

/// Delivery problems are reported in the outcome, never as an error status.
async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<Json<MessageOutcome>> {
    let messenger = state
        .messenger
        .ok_or_else(|| ApiError::service_unavailable("Messaging not available"))?;
    if body.from.trim().is_empty() {
        return Err(ApiError::validation("from must not be blank"));
    }
    if body.body.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::validation(format!(
            "message body exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(Json(
        messenger
            .send_direct_message(body.from.trim(), body.to.trim(), &body.body)
            .await,
    ))
}
