//! Webhook subscription management: tenants register a URL
//! and the event set they want fanned out to it; delivery/retry happens in
//! `webhook::WebhookFanout`, not here.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use crate::models::{Error, NewWebhookSubscription, Permission, WebhookDelivery, WebhookSubscription, WebhookSubscriptionId};

use super::auth::authorize;
use super::error::ApiError;
use super::ApiState;

pub async fn create(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<NewWebhookSubscription>,
) -> Result<(StatusCode, Json<WebhookSubscription>), ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageWebhooks).await?;
    let subscription = state.webhooks.create(caller.tenant.id, body).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn list(State(state): State<ApiState>, headers: HeaderMap) -> Result<Json<Vec<WebhookSubscription>>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageWebhooks).await?;
    let subscriptions = state.webhooks.list(caller.tenant.id).await?;
    Ok(Json(subscriptions))
}

pub async fn remove(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<WebhookSubscriptionId>,
) -> Result<StatusCode, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageWebhooks).await?;
    state.webhooks.remove(caller.tenant.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /webhooks/{id}/test`. Fires a synthetic delivery for the first
/// event the subscription is registered for, so an integrator can confirm
/// their endpoint is reachable before relying on real traffic.
pub async fn test(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<WebhookSubscriptionId>,
) -> Result<Json<WebhookDelivery>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageWebhooks).await?;
    let subscription = state.webhooks.get(caller.tenant.id, id).await?.ok_or(Error::NotFound("webhook not found"))?;
    let event = *subscription
        .events
        .iter()
        .next()
        .ok_or_else(|| Error::BadRequest("subscription has no events to test".into()))?;

    let payload = json!({
        "event": event,
        "test": true,
        "subscription_id": subscription.id,
    });
    let delivery = state.webhooks.enqueue_delivery(subscription.id, event, payload).await?;
    Ok(Json(delivery))
}
