//! Per-user settings: preferences, contact details, push subscriptions and
//! delivery history.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    HistoryParams, PreferenceResponse, PushSubscriptionRequest, UpdateContactRequest,
};
use crate::api::server::AppState;
use crate::database::models::{
    DeliveryRecordDbModel, PushSubscriptionDbModel, RecipientContactDbModel,
};
use crate::database::repositories::{SqlxPreferenceRepository, SqlxRecipientDirectory};
use crate::domain::{NotificationPreference, TriggerType};
use crate::notification::channels::RecipientDirectory;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/{user}/preferences/{trigger}",
            get(get_preference)
                .put(put_preference)
                .delete(delete_preference),
        )
        .route("/{user}/contact", get(get_contact).put(put_contact))
        .route(
            "/{user}/push-subscriptions",
            get(list_push_subscriptions).post(add_push_subscription),
        )
        .route("/{user}/deliveries", get(delivery_history))
}

fn preferences(state: &AppState) -> ApiResult<Arc<SqlxPreferenceRepository>> {
    state
        .preferences
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Preference store not available"))
}

fn directory(state: &AppState) -> ApiResult<Arc<SqlxRecipientDirectory>> {
    state
        .directory
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Recipient directory not available"))
}

fn parse_trigger(raw: &str) -> ApiResult<TriggerType> {
    TriggerType::parse(raw)
        .ok_or_else(|| ApiError::validation(format!("Unknown trigger type '{raw}'")))
}

fn validate_preference(preference: &NotificationPreference) -> ApiResult<()> {
    if let Some(quiet) = &preference.quiet_hours
        && quiet.timezone.parse::<chrono_tz::Tz>().is_err()
    {
        return Err(ApiError::validation(format!(
            "Unknown timezone '{}'",
            quiet.timezone
        )));
    }
    if let Some((channel, _)) = preference.rate_ceilings.iter().find(|(_, c)| c.max == 0) {
        return Err(ApiError::validation(format!(
            "Rate ceiling for {channel} must allow at least one message; remove the channel instead"
        )));
    }
    Ok(())
}

async fn get_preference(
    State(state): State<AppState>,
    Path((user, trigger)): Path<(String, String)>,
) -> ApiResult<Json<PreferenceResponse>> {
    let trigger = parse_trigger(&trigger)?;
    let saved = preferences(&state)?.get_saved(&user, trigger).await?;
    let (saved, preference) = match saved {
        Some(row) => (true, row.to_preference()?),
        None => (false, NotificationPreference::defaults_for(trigger)),
    };
    Ok(Json(PreferenceResponse {
        user,
        trigger: trigger.as_str().to_string(),
        saved,
        preference,
    }))
}

async fn put_preference(
    State(state): State<AppState>,
    Path((user, trigger)): Path<(String, String)>,
    Json(preference): Json<NotificationPreference>,
) -> ApiResult<Json<PreferenceResponse>> {
    let trigger = parse_trigger(&trigger)?;
    validate_preference(&preference)?;
    preferences(&state)?
        .upsert(&user, trigger, &preference, state.clock.now_ms())
        .await?;
    Ok(Json(PreferenceResponse {
        user,
        trigger: trigger.as_str().to_string(),
        saved: true,
        preference,
    }))
}

async fn delete_preference(
    State(state): State<AppState>,
    Path((user, trigger)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let trigger = parse_trigger(&trigger)?;
    preferences(&state)?.delete(&user, trigger).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_contact(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> ApiResult<Json<RecipientContactDbModel>> {
    directory(&state)?
        .get_contact(&user)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No contact details for '{user}'")))
}

async fn put_contact(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(body): Json<UpdateContactRequest>,
) -> ApiResult<Json<RecipientContactDbModel>> {
    if let Some(email) = &body.email
        && !email.contains('@')
    {
        return Err(ApiError::validation("email must contain '@'"));
    }
    let contact = RecipientContactDbModel {
        user_id: user,
        email: body.email,
        phone: body.phone,
        updated_at: state.clock.now_ms(),
    };
    directory(&state)?.upsert_contact(&contact).await?;
    Ok(Json(contact))
}

async fn list_push_subscriptions(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> ApiResult<Json<Vec<PushSubscriptionDbModel>>> {
    Ok(Json(directory(&state)?.push_subscriptions_for(&user).await?))
}

async fn add_push_subscription(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(body): Json<PushSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<PushSubscriptionDbModel>)> {
    if url::Url::parse(&body.endpoint).map(|u| u.scheme() != "https").unwrap_or(true) {
        return Err(ApiError::validation("endpoint must be an https URL"));
    }
    let now_ms = state.clock.now_ms();
    let subscription = PushSubscriptionDbModel {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user,
        endpoint: body.endpoint,
        p256dh: body.keys.p256dh,
        auth: body.keys.auth,
        next_attempt_at: None,
        created_at: now_ms,
        updated_at: now_ms,
    };
    directory(&state)?
        .upsert_push_subscription(&subscription)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn delivery_history(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<DeliveryRecordDbModel>>> {
    let service = state
        .notification_service
        .ok_or_else(|| ApiError::service_unavailable("Notification service not available"))?;
    Ok(Json(
        service
            .recipient_history(&user, params.effective_limit())
            .await?,
    ))
}
