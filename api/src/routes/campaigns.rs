use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use engage_core::campaigns::{BatchPlan, CampaignAction, CampaignStatus};
use engage_core::contacts::normalize_tags;
use engage_core::delivery::RecipientStatus;
use engage_core::pagination::{PaginatedResponse, clamp_limit, decode_cursor};
use engage_core::roles::Permission;
use engage_core::templates::TemplateStatus;

use crate::analytics::{CampaignAnalyticsResponse, load_campaign_analytics, recompute_campaign_analytics};
use crate::auth::AuthenticatedUser;
use crate::db::begin_tenant;
use crate::error::AppError;
use crate::extract::{AppJson, AppQuery};
use crate::sender::materialize_recipients;
use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct CampaignResponse {
    pub id: Uuid,
    pub name: String,
    pub template_id: Uuid,
    pub status: CampaignStatus,
    pub tag_filter: Vec<String>,
    pub template_params: Vec<String>,
    pub batch_size: i32,
    pub batch_delay_ms: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    name: String,
    template_id: Uuid,
    status: String,
    tag_filter: Vec<String>,
    template_params: Vec<String>,
    batch_size: i32,
    batch_delay_ms: i32,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    dispatched_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CampaignRow {
    fn status(&self) -> Result<CampaignStatus, AppError> {
        Ok(CampaignStatus::parse(&self.status)?)
    }

    fn into_response(self) -> Result<CampaignResponse, AppError> {
        Ok(CampaignResponse {
            status: self.status()?,
            id: self.id,
            name: self.name,
            template_id: self.template_id,
            tag_filter: self.tag_filter,
            template_params: self.template_params,
            batch_size: self.batch_size,
            batch_delay_ms: self.batch_delay_ms,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            dispatched_at: self.dispatched_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            last_error: self.last_error,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const CAMPAIGN_COLUMNS: &str = "id, name, template_id, status, tag_filter, template_params, batch_size, \
     batch_delay_ms, scheduled_at, started_at, dispatched_at, completed_at, cancelled_at, last_error, \
     created_by, created_at, updated_at";

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub template_id: Uuid,
    /// Contacts carrying any of these tags; empty targets every contact
    #[serde(default)]
    pub tag_filter: Vec<String>,
    /// Values for the template's `{{1}}`..`{{n}}` placeholders
    #[serde(default)]
    pub template_params: Vec<String>,
    #[serde(default)]
    pub batch_size: Option<i32>,
    #[serde(default)]
    pub batch_delay_ms: Option<i32>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateCampaignRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub tag_filter: Option<Vec<String>>,
    #[serde(default)]
    pub template_params: Option<Vec<String>>,
    #[serde(default)]
    pub batch_size: Option<i32>,
    #[serde(default)]
    pub batch_delay_ms: Option<i32>,
}

/// Either an absolute instant, or a wall-clock time in an IANA timezone.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ScheduleCampaignRequest {
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// e.g. `2025-07-01T09:30:00`
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub local_time: Option<NaiveDateTime>,
    /// e.g. `Europe/Berlin`
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Deserialize, utoipa::IntoParams)]
pub struct ListCampaignsParams {
    pub status: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize, utoipa::IntoParams)]
pub struct ListRecipientsParams {
    pub status: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct RecipientResponse {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub phone_e164: String,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/campaigns", get(list_campaigns).post(create_campaign))
        .route(
            "/v1/campaigns/{id}",
            get(get_campaign).patch(update_campaign).delete(delete_campaign),
        )
        .route("/v1/campaigns/{id}/schedule", post(schedule_campaign))
        .route("/v1/campaigns/{id}/start", post(start_campaign))
        .route("/v1/campaigns/{id}/cancel", post(cancel_campaign))
        .route("/v1/campaigns/{id}/recipients", get(list_recipients))
        .route("/v1/campaigns/{id}/analytics", get(get_campaign_analytics))
}

fn campaign_name(raw: &str) -> Result<String, AppError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > 200 {
        return Err(AppError::validation("name", "must be 1 to 200 characters"));
    }
    Ok(name.to_string())
}

/// Resolve a schedule request to a UTC instant strictly after `now`.
///
/// Local times that fall into a DST gap are rejected; ambiguous local times
/// (clocks turned back) resolve to the earlier instant.
pub fn resolve_schedule(req: &ScheduleCampaignRequest, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    let at = match (req.scheduled_at, req.local_time, req.timezone.as_deref()) {
        (Some(at), None, None) => at,
        (None, Some(local), Some(tz)) => {
            let tz: Tz = tz.trim().parse().map_err(|_| AppError::Validation {
                message: "unknown IANA timezone".to_string(),
                field: Some("timezone".to_string()),
                received: Some(serde_json::json!(tz)),
                docs_hint: Some("Use a zone name such as 'Europe/Berlin' or 'America/Sao_Paulo'.".to_string()),
            })?;
            match tz.from_local_datetime(&local) {
                LocalResult::Single(at) => at.with_timezone(&Utc),
                LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
                LocalResult::None => {
                    return Err(AppError::validation(
                        "local_time",
                        format!("{local} does not exist in {tz} (daylight saving gap)"),
                    ));
                }
            }
        }
        (None, Some(_), None) => {
            return Err(AppError::validation("timezone", "local_time requires a timezone"));
        }
        _ => {
            return Err(AppError::validation(
                "scheduled_at",
                "provide either scheduled_at, or local_time with timezone",
            ));
        }
    };
    if at <= now {
        return Err(AppError::Validation {
            message: "schedule time must be in the future".to_string(),
            field: Some("scheduled_at".to_string()),
            received: Some(serde_json::json!(at.to_rfc3339())),
            docs_hint: None,
        });
    }
    Ok(at)
}

#[derive(sqlx::FromRow)]
struct TemplateCheckRow {
    name: String,
    status: String,
    placeholder_count: i32,
}

/// The campaign's template must be approved and take exactly as many
/// parameters as the campaign supplies.
async fn ensure_sendable_template(
    conn: &mut PgConnection,
    template_id: Uuid,
    params: usize,
) -> Result<(), AppError> {
    let template = sqlx::query_as::<_, TemplateCheckRow>(
        "SELECT name, status, placeholder_count FROM message_templates WHERE id = $1",
    )
    .bind(template_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Template {template_id}")))?;

    if !TemplateStatus::parse(&template.status)?.is_sendable() {
        return Err(AppError::conflict(format!(
            "Template '{}' is {}, only approved templates can be sent",
            template.name, template.status
        )));
    }
    if template.placeholder_count as usize != params {
        return Err(AppError::Validation {
            message: format!(
                "Template '{}' has {} placeholders but the campaign supplies {params} parameters",
                template.name, template.placeholder_count
            ),
            field: Some("template_params".to_string()),
            received: Some(serde_json::json!(params)),
            docs_hint: Some("Update template_params while the campaign is a draft.".to_string()),
        });
    }
    Ok(())
}

async fn ensure_template_exists(conn: &mut PgConnection, template_id: Uuid) -> Result<(), AppError> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM message_templates WHERE id = $1)")
        .bind(template_id)
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(AppError::not_found(format!("Template {template_id}")))
    }
}

async fn lock_campaign(conn: &mut PgConnection, id: Uuid) -> Result<CampaignRow, AppError> {
    sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Campaign {id}")))
}

async fn campaign_exists(conn: &mut PgConnection, id: Uuid) -> Result<(), AppError> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM campaigns WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(AppError::not_found(format!("Campaign {id}")))
    }
}

/// List campaigns, newest first
#[utoipa::path(
    get,
    path = "/v1/campaigns",
    params(ListCampaignsParams),
    responses((status = 200, description = "Page of campaigns", body = PaginatedResponse<CampaignResponse>)),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn list_campaigns(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppQuery(params): AppQuery<ListCampaignsParams>,
) -> Result<Json<PaginatedResponse<CampaignResponse>>, AppError> {
    user.require(Permission::ViewCampaigns, "list campaigns")?;
    let limit = clamp_limit(params.limit);
    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;
    let status = params
        .status
        .as_deref()
        .map(CampaignStatus::parse)
        .transpose()?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let rows = sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
         WHERE ($1::timestamptz IS NULL OR (created_at, id) < ($1, $2)) \
           AND ($3::text IS NULL OR status = $3) \
         ORDER BY created_at DESC, id DESC LIMIT $4"
    ))
    .bind(cursor.map(|c| c.timestamp))
    .bind(cursor.map(|c| c.id))
    .bind(status.map(CampaignStatus::as_str))
    .bind(limit + 1)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    let campaigns = rows
        .into_iter()
        .map(CampaignRow::into_response)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(PaginatedResponse::from_rows(campaigns, limit, |c| {
        (c.created_at, c.id)
    })))
}

/// Create a draft campaign
#[utoipa::path(
    post,
    path = "/v1/campaigns",
    request_body = CreateCampaignRequest,
    responses(
        (status = 201, description = "Draft created", body = CampaignResponse),
        (status = 400, description = "Invalid batching or name", body = engage_core::error::ApiError),
        (status = 404, description = "Template not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn create_campaign(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<CampaignResponse>), AppError> {
    user.require(Permission::ManageCampaigns, "create campaign")?;
    let name = campaign_name(&req.name)?;
    let plan = BatchPlan::new(req.batch_size, req.batch_delay_ms)?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    ensure_template_exists(&mut tx, req.template_id).await?;
    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "INSERT INTO campaigns \
             (id, organization_id, name, template_id, tag_filter, template_params, batch_size, batch_delay_ms, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {CAMPAIGN_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(user.organization_id)
    .bind(&name)
    .bind(req.template_id)
    .bind(normalize_tags(req.tag_filter))
    .bind(&req.template_params)
    .bind(plan.batch_size)
    .bind(plan.batch_delay.as_millis() as i32)
    .bind(user.profile_id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(campaign_id = %row.id, actor = %user.profile_id, "campaign created");
    Ok((StatusCode::CREATED, Json(row.into_response()?)))
}

/// Get a campaign
#[utoipa::path(
    get,
    path = "/v1/campaigns/{id}",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    responses(
        (status = 200, description = "Campaign", body = CampaignResponse),
        (status = 404, description = "Campaign not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn get_campaign(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, AppError> {
    user.require(Permission::ViewCampaigns, "get campaign")?;
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Campaign {id}")))?;
    tx.commit().await?;
    Ok(Json(row.into_response()?))
}

/// Edit a draft campaign
#[utoipa::path(
    patch,
    path = "/v1/campaigns/{id}",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    request_body = UpdateCampaignRequest,
    responses(
        (status = 200, description = "Campaign updated", body = CampaignResponse),
        (status = 404, description = "Campaign not found", body = engage_core::error::ApiError),
        (status = 409, description = "Campaign is no longer a draft", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn update_campaign(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<UpdateCampaignRequest>,
) -> Result<Json<CampaignResponse>, AppError> {
    user.require(Permission::ManageCampaigns, "update campaign")?;
    let name = req.name.as_deref().map(campaign_name).transpose()?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let current = lock_campaign(&mut tx, id).await?;
    let status = current.status()?;
    if !status.is_editable() {
        return Err(AppError::InvalidTransition {
            message: format!("Campaign is {}, only drafts can be edited", status.as_str()),
        });
    }
    let plan = BatchPlan::new(
        Some(req.batch_size.unwrap_or(current.batch_size)),
        Some(req.batch_delay_ms.unwrap_or(current.batch_delay_ms)),
    )?;
    if let Some(template_id) = req.template_id {
        ensure_template_exists(&mut tx, template_id).await?;
    }

    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "UPDATE campaigns SET \
             name = COALESCE($2, name), \
             template_id = COALESCE($3, template_id), \
             tag_filter = COALESCE($4, tag_filter), \
             template_params = COALESCE($5, template_params), \
             batch_size = $6, \
             batch_delay_ms = $7, \
             updated_at = NOW() \
         WHERE id = $1 RETURNING {CAMPAIGN_COLUMNS}"
    ))
    .bind(id)
    .bind(name)
    .bind(req.template_id)
    .bind(req.tag_filter.map(normalize_tags))
    .bind(req.template_params)
    .bind(plan.batch_size)
    .bind(plan.batch_delay.as_millis() as i32)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(Json(row.into_response()?))
}

/// Delete a draft campaign
#[utoipa::path(
    delete,
    path = "/v1/campaigns/{id}",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    responses(
        (status = 204, description = "Campaign deleted"),
        (status = 404, description = "Campaign not found", body = engage_core::error::ApiError),
        (status = 409, description = "Campaign is no longer a draft", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn delete_campaign(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    user.require(Permission::ManageCampaigns, "delete campaign")?;
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let current = lock_campaign(&mut tx, id).await?;
    let status = current.status()?;
    if !status.is_editable() {
        return Err(AppError::InvalidTransition {
            message: format!(
                "Campaign is {}, only drafts can be deleted; cancel it instead",
                status.as_str()
            ),
        });
    }
    sqlx::query("DELETE FROM campaigns WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!(campaign_id = %id, actor = %user.profile_id, "campaign deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Schedule a draft campaign for later dispatch
#[utoipa::path(
    post,
    path = "/v1/campaigns/{id}/schedule",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    request_body = ScheduleCampaignRequest,
    responses(
        (status = 200, description = "Campaign scheduled", body = CampaignResponse),
        (status = 400, description = "Invalid time, timezone or params", body = engage_core::error::ApiError),
        (status = 409, description = "Not a draft, or template not approved", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn schedule_campaign(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<ScheduleCampaignRequest>,
) -> Result<Json<CampaignResponse>, AppError> {
    user.require(Permission::ManageCampaigns, "schedule campaign")?;
    let scheduled_at = resolve_schedule(&req, Utc::now())?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let current = lock_campaign(&mut tx, id).await?;
    let next = current.status()?.transition(CampaignAction::Schedule)?;
    ensure_sendable_template(&mut tx, current.template_id, current.template_params.len()).await?;

    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "UPDATE campaigns SET status = $2, scheduled_at = $3, updated_at = NOW() \
         WHERE id = $1 RETURNING {CAMPAIGN_COLUMNS}"
    ))
    .bind(id)
    .bind(next.as_str())
    .bind(scheduled_at)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(campaign_id = %id, scheduled_at = %scheduled_at, "campaign scheduled");
    Ok(Json(row.into_response()?))
}

/// Start sending now
///
/// Recipients are materialized immediately; the dispatcher picks the
/// campaign up on its next tick.
#[utoipa::path(
    post,
    path = "/v1/campaigns/{id}/start",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    responses(
        (status = 200, description = "Campaign is sending", body = CampaignResponse),
        (status = 400, description = "Parameter count mismatch", body = engage_core::error::ApiError),
        (status = 409, description = "Invalid transition, or template not approved", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn start_campaign(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, AppError> {
    user.require(Permission::ManageCampaigns, "start campaign")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let current = lock_campaign(&mut tx, id).await?;
    let next = current.status()?.transition(CampaignAction::Start)?;
    ensure_sendable_template(&mut tx, current.template_id, current.template_params.len()).await?;

    let recipients = materialize_recipients(&mut tx, id).await?;
    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "UPDATE campaigns SET status = $2, started_at = NOW(), updated_at = NOW() \
         WHERE id = $1 RETURNING {CAMPAIGN_COLUMNS}"
    ))
    .bind(id)
    .bind(next.as_str())
    .fetch_one(&mut *tx)
    .await?;
    recompute_campaign_analytics(&mut tx, id).await?;
    tx.commit().await?;

    tracing::info!(campaign_id = %id, recipients, actor = %user.profile_id, "campaign started");
    Ok(Json(row.into_response()?))
}

/// Cancel a draft, scheduled or sending campaign
///
/// Recipients not yet sent stay `pending`; messages already handed to the
/// gateway keep receiving delivery updates.
#[utoipa::path(
    post,
    path = "/v1/campaigns/{id}/cancel",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    responses(
        (status = 200, description = "Campaign cancelled", body = CampaignResponse),
        (status = 409, description = "Campaign already finished", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn cancel_campaign(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, AppError> {
    user.require(Permission::ManageCampaigns, "cancel campaign")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let current = lock_campaign(&mut tx, id).await?;
    let next = current.status()?.transition(CampaignAction::Cancel)?;
    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "UPDATE campaigns SET status = $2, cancelled_at = NOW(), updated_at = NOW() \
         WHERE id = $1 RETURNING {CAMPAIGN_COLUMNS}"
    ))
    .bind(id)
    .bind(next.as_str())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(campaign_id = %id, actor = %user.profile_id, "campaign cancelled");
    Ok(Json(row.into_response()?))
}

/// Per-recipient delivery state
#[utoipa::path(
    get,
    path = "/v1/campaigns/{id}/recipients",
    params(("id" = Uuid, Path, description = "Campaign ID"), ListRecipientsParams),
    responses(
        (status = 200, description = "Page of recipients", body = PaginatedResponse<RecipientResponse>),
        (status = 404, description = "Campaign not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn list_recipients(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppQuery(params): AppQuery<ListRecipientsParams>,
) -> Result<Json<PaginatedResponse<RecipientResponse>>, AppError> {
    user.require(Permission::ViewCampaigns, "list campaign recipients")?;
    let limit = clamp_limit(params.limit);
    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;
    let status = params
        .status
        .as_deref()
        .map(RecipientStatus::parse)
        .transpose()?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    campaign_exists(&mut tx, id).await?;
    let rows = sqlx::query_as::<_, RecipientResponse>(
        "SELECT id, contact_id, phone_e164, status, provider_message_id, attempts, next_attempt_at, \
                error_code, error_message, sent_at, delivered_at, read_at, failed_at, created_at \
         FROM campaign_recipients \
         WHERE campaign_id = $1 \
           AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3)) \
           AND ($4::text IS NULL OR status = $4) \
         ORDER BY created_at, id LIMIT $5",
    )
    .bind(id)
    .bind(cursor.map(|c| c.timestamp))
    .bind(cursor.map(|c| c.id))
    .bind(status.map(RecipientStatus::as_str))
    .bind(limit + 1)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(PaginatedResponse::from_rows(rows, limit, |r| {
        (r.created_at, r.id)
    })))
}

/// Delivery analytics of a campaign
#[utoipa::path(
    get,
    path = "/v1/campaigns/{id}/analytics",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    responses(
        (status = 200, description = "Aggregate delivery statistics", body = CampaignAnalyticsResponse),
        (status = 404, description = "Campaign not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "campaigns"
)]
pub async fn get_campaign_analytics(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignAnalyticsResponse>, AppError> {
    user.require(Permission::ViewAnalytics, "get campaign analytics")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    campaign_exists(&mut tx, id).await?;
    let row = match load_campaign_analytics(&mut tx, id).await? {
        Some(row) => row,
        None => {
            recompute_campaign_analytics(&mut tx, id).await?;
            load_campaign_analytics(&mut tx, id)
                .await?
                .ok_or_else(|| AppError::not_found(format!("Analytics for campaign {id}")))?
        }
    };
    tx.commit().await?;
    Ok(Json(row.into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn request(
        scheduled_at: Option<DateTime<Utc>>,
        local_time: Option<NaiveDateTime>,
        timezone: Option<&str>,
    ) -> ScheduleCampaignRequest {
        ScheduleCampaignRequest {
            scheduled_at,
            local_time,
            timezone: timezone.map(str::to_string),
        }
    }

    #[test]
    fn absolute_schedule_must_be_in_the_future() {
        let later = now() + chrono::Duration::hours(1);
        assert_eq!(resolve_schedule(&request(Some(later), None, None), now()).unwrap(), later);
        assert!(resolve_schedule(&request(Some(now()), None, None), now()).is_err());
    }

    #[test]
    fn local_time_is_converted_through_the_zone() {
        // Berlin is UTC+1 in winter.
        let at = resolve_schedule(
            &request(None, Some(local(2025, 3, 2, 9, 30)), Some("Europe/Berlin")),
            now(),
        )
        .unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 3, 2, 8, 30, 0).unwrap());
    }

    #[test]
    fn dst_gap_is_rejected_and_overlap_takes_earliest() {
        // 2025-03-30 02:30 does not exist in Berlin.
        assert!(
            resolve_schedule(
                &request(None, Some(local(2025, 3, 30, 2, 30)), Some("Europe/Berlin")),
                now(),
            )
            .is_err()
        );
        // 2025-10-26 02:30 happens twice; the first is still CEST (UTC+2).
        let at = resolve_schedule(
            &request(None, Some(local(2025, 10, 26, 2, 30)), Some("Europe/Berlin")),
            now(),
        )
        .unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 10, 26, 0, 30, 0).unwrap());
    }

    #[test]
    fn schedule_forms_are_exclusive() {
        let later = now() + chrono::Duration::hours(1);
        assert!(resolve_schedule(&request(None, None, None), now()).is_err());
        assert!(resolve_schedule(&request(None, Some(local(2025, 4, 1, 9, 0)), None), now()).is_err());
        assert!(
            resolve_schedule(
                &request(Some(later), Some(local(2025, 4, 1, 9, 0)), Some("UTC")),
                now()
            )
            .is_err()
        );
        assert!(
            resolve_schedule(&request(None, Some(local(2025, 4, 1, 9, 0)), Some("Mars/Olympus")), now())
                .is_err()
        );
    }

    #[test]
    fn campaign_names_are_bounded() {
        assert_eq!(campaign_name(" Spring sale ").unwrap(), "Spring sale");
        assert!(campaign_name("").is_err());
    }
}
