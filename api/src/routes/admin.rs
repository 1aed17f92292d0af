use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::roles::Permission;
use engage_core::webhook::WebhookPayload;

use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::extract::AppQuery;
use crate::ingest;
use crate::state::AppState;

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct WebhookEventSummary {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub error: Option<String>,
}

#[derive(Deserialize, utoipa::IntoParams)]
pub struct ListWebhookEventsParams {
    /// Only events that have not been processed successfully (default true)
    pub unprocessed: Option<bool>,
    /// Max results (default 50, max 200)
    pub limit: Option<i64>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReplayResponse {
    pub event_id: Uuid,
    pub statuses_applied: u64,
    pub statuses_ignored: u64,
    pub statuses_parked: u64,
    pub inbound_stored: u64,
    pub templates_updated: u64,
    pub campaigns_completed: u64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/webhooks", get(list_webhook_events))
        .route("/v1/admin/webhooks/{event_id}/replay", post(replay_webhook_event))
}

/// List stored webhook deliveries, newest first
#[utoipa::path(
    get,
    path = "/v1/admin/webhooks",
    params(ListWebhookEventsParams),
    responses((status = 200, description = "Stored webhook events", body = Vec<WebhookEventSummary>)),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn list_webhook_events(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppQuery(params): AppQuery<ListWebhookEventsParams>,
) -> Result<Json<Vec<WebhookEventSummary>>, AppError> {
    user.require(Permission::ManageOrganization, "list webhook events")?;
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let events = sqlx::query_as::<_, WebhookEventSummary>(
        "SELECT id, received_at, processed_at, attempts, error FROM webhook_events \
         WHERE ($1 = FALSE OR processed_at IS NULL) \
         ORDER BY received_at DESC LIMIT $2",
    )
    .bind(params.unprocessed.unwrap_or(true))
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(events))
}

/// Reprocess a stored webhook delivery
///
/// Processing is idempotent: statuses never move backwards and inbound
/// messages are keyed by provider message id.
#[utoipa::path(
    post,
    path = "/v1/admin/webhooks/{event_id}/replay",
    params(("event_id" = Uuid, Path, description = "Stored webhook event ID")),
    responses(
        (status = 200, description = "Event reprocessed", body = ReplayResponse),
        (status = 404, description = "Event not found", body = engage_core::error::ApiError),
        (status = 500, description = "Processing failed again; the error is kept on the event", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn replay_webhook_event(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<ReplayResponse>, AppError> {
    user.require(Permission::ManageOrganization, "replay webhook event")?;

    let raw: serde_json::Value =
        sqlx::query_scalar("SELECT payload FROM webhook_events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&state.db)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Webhook event {event_id}")))?;
    let payload: WebhookPayload = match serde_json::from_value(raw) {
        Ok(payload) => payload,
        Err(e) => {
            let reason = format!("unexpected webhook shape: {e}");
            ingest::mark_failed(&state.db, event_id, &reason).await?;
            return Err(AppError::Internal(format!("stored webhook {event_id} is unreadable: {reason}")));
        }
    };

    tracing::info!(event_id = %event_id, actor = %user.profile_id, "replaying webhook event");
    let report = ingest::process_event(
        &state.db,
        event_id,
        &payload,
        state.config.completion_grace(),
    )
    .await?;

    Ok(Json(ReplayResponse {
        event_id,
        statuses_applied: report.statuses_applied,
        statuses_ignored: report.statuses_ignored,
        statuses_parked: report.statuses_parked,
        inbound_stored: report.inbound_stored,
        templates_updated: report.templates_updated,
        campaigns_completed: report.campaigns_completed,
    }))
}
