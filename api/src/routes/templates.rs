use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::roles::Permission;
use engage_core::templates::{
    TemplateCategory, TemplateStatus, render, validate_body, validate_name,
};

use crate::auth::AuthenticatedUser;
use crate::db::begin_tenant;
use crate::error::AppError;
use crate::extract::{AppJson, AppQuery};
use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct TemplateResponse {
    pub id: Uuid,
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub body: String,
    pub placeholder_count: i32,
    pub status: TemplateStatus,
    pub provider_template_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct TemplateRow {
    pub id: Uuid,
    pub name: String,
    pub language: String,
    pub category: String,
    pub body: String,
    pub placeholder_count: i32,
    pub status: String,
    pub provider_template_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TemplateRow {
    pub fn into_response(self) -> Result<TemplateResponse, AppError> {
        Ok(TemplateResponse {
            category: TemplateCategory::parse(&self.category)?,
            status: TemplateStatus::parse(&self.status)?,
            id: self.id,
            name: self.name,
            language: self.language,
            body: self.body,
            placeholder_count: self.placeholder_count,
            provider_template_id: self.provider_template_id,
            rejection_reason: self.rejection_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) const TEMPLATE_COLUMNS: &str = "id, name, language, category, body, placeholder_count, status, \
     provider_template_id, rejection_reason, created_at, updated_at";

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateTemplateRequest {
    pub name: String,
    /// Gateway language code, e.g. `en_US`
    pub language: String,
    pub category: TemplateCategory,
    pub body: String,
    #[serde(default)]
    pub provider_template_id: Option<String>,
}

/// `status` and `provider_template_id` mirror the approval state managed in
/// the gateway's business console. Editing `body` resets approval to `pending`.
#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateTemplateRequest {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub category: Option<TemplateCategory>,
    #[serde(default)]
    pub status: Option<TemplateStatus>,
    #[serde(default)]
    pub provider_template_id: Option<String>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PreviewTemplateRequest {
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct PreviewTemplateResponse {
    pub rendered: String,
    pub placeholder_count: i32,
}

#[derive(Deserialize, utoipa::IntoParams)]
pub struct ListTemplatesParams {
    pub status: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/templates", get(list_templates).post(create_template))
        .route(
            "/v1/templates/{id}",
            get(get_template).patch(update_template).delete(delete_template),
        )
        .route("/v1/templates/{id}/preview", post(preview_template))
}

fn require_read(user: &AuthenticatedUser, operation: &str) -> Result<(), AppError> {
    if user.role.can(Permission::ViewCampaigns) {
        return Ok(());
    }
    user.require(Permission::ManageTemplates, operation)
}

fn validate_language(raw: &str) -> Result<String, AppError> {
    let language = raw.trim();
    let valid = (2..=15).contains(&language.len())
        && language
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '_' || c == '-');
    if !valid {
        return Err(AppError::validation(
            "language",
            "must be a language code such as 'en' or 'pt_BR'",
        ));
    }
    Ok(language.to_string())
}

async fn fetch_template(
    conn: &mut sqlx::PgConnection,
    id: Uuid,
) -> Result<TemplateRow, AppError> {
    sqlx::query_as::<_, TemplateRow>(&format!(
        "SELECT {TEMPLATE_COLUMNS} FROM message_templates WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Template {id}")))
}

/// List message templates
#[utoipa::path(
    get,
    path = "/v1/templates",
    params(ListTemplatesParams),
    responses((status = 200, description = "Templates", body = Vec<TemplateResponse>)),
    security(("bearer_auth" = [])),
    tag = "templates"
)]
pub async fn list_templates(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppQuery(params): AppQuery<ListTemplatesParams>,
) -> Result<Json<Vec<TemplateResponse>>, AppError> {
    require_read(&user, "list templates")?;
    let status = params
        .status
        .as_deref()
        .map(TemplateStatus::parse)
        .transpose()?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let rows = sqlx::query_as::<_, TemplateRow>(&format!(
        "SELECT {TEMPLATE_COLUMNS} FROM message_templates \
         WHERE ($1::text IS NULL OR status = $1) ORDER BY name, language"
    ))
    .bind(status.map(TemplateStatus::as_str))
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    let templates = rows
        .into_iter()
        .map(TemplateRow::into_response)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(templates))
}

/// Register a template (starts `pending` until the gateway approves it)
#[utoipa::path(
    post,
    path = "/v1/templates",
    request_body = CreateTemplateRequest,
    responses(
        (status = 201, description = "Template created", body = TemplateResponse),
        (status = 400, description = "Invalid name, language or body", body = engage_core::error::ApiError),
        (status = 409, description = "Name and language already exist", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "templates"
)]
pub async fn create_template(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<TemplateResponse>), AppError> {
    user.require(Permission::ManageTemplates, "create template")?;
    let name = req.name.trim();
    validate_name(name)?;
    let language = validate_language(&req.language)?;
    let placeholders = validate_body(&req.body)?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let row = sqlx::query_as::<_, TemplateRow>(&format!(
        "INSERT INTO message_templates \
             (id, organization_id, name, language, category, body, placeholder_count, provider_template_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {TEMPLATE_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(user.organization_id)
    .bind(name)
    .bind(&language)
    .bind(req.category.as_str())
    .bind(&req.body)
    .bind(placeholders as i32)
    .bind(req.provider_template_id.as_deref().map(str::trim))
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(template_id = %row.id, name = %row.name, "template created");
    Ok((StatusCode::CREATED, Json(row.into_response()?)))
}

/// Get a template
#[utoipa::path(
    get,
    path = "/v1/templates/{id}",
    params(("id" = Uuid, Path, description = "Template ID")),
    responses(
        (status = 200, description = "Template", body = TemplateResponse),
        (status = 404, description = "Template not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "templates"
)]
pub async fn get_template(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TemplateResponse>, AppError> {
    require_read(&user, "get template")?;
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let row = fetch_template(&mut tx, id).await?;
    tx.commit().await?;
    Ok(Json(row.into_response()?))
}

/// Update a template
#[utoipa::path(
    patch,
    path = "/v1/templates/{id}",
    params(("id" = Uuid, Path, description = "Template ID")),
    request_body = UpdateTemplateRequest,
    responses(
        (status = 200, description = "Template updated", body = TemplateResponse),
        (status = 400, description = "Invalid body", body = engage_core::error::ApiError),
        (status = 404, description = "Template not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "templates"
)]
pub async fn update_template(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<UpdateTemplateRequest>,
) -> Result<Json<TemplateResponse>, AppError> {
    user.require(Permission::ManageTemplates, "update template")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let current = fetch_template(&mut tx, id).await?;

    let body_changed = req.body.as_ref().is_some_and(|b| *b != current.body);
    let placeholders = match &req.body {
        Some(body) if body_changed => Some(validate_body(body)? as i32),
        _ => None,
    };
    let status = if body_changed {
        Some(TemplateStatus::Pending)
    } else {
        req.status
    };

    let row = sqlx::query_as::<_, TemplateRow>(&format!(
        "UPDATE message_templates SET \
             body = CASE WHEN $2 THEN $3 ELSE body END, \
             placeholder_count = COALESCE($4, placeholder_count), \
             category = COALESCE($5, category), \
             status = COALESCE($6, status), \
             rejection_reason = CASE WHEN $6 IS NULL OR $6 = 'rejected' THEN rejection_reason ELSE NULL END, \
             provider_template_id = COALESCE($7, provider_template_id), \
             updated_at = NOW() \
         WHERE id = $1 RETURNING {TEMPLATE_COLUMNS}"
    ))
    .bind(id)
    .bind(body_changed)
    .bind(req.body.as_deref())
    .bind(placeholders)
    .bind(req.category.map(TemplateCategory::as_str))
    .bind(status.map(TemplateStatus::as_str))
    .bind(req.provider_template_id.as_deref().map(str::trim))
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    if body_changed {
        tracing::info!(template_id = %id, "template body edited, approval reset to pending");
    }
    Ok(Json(row.into_response()?))
}

/// Delete a template that no campaign uses
#[utoipa::path(
    delete,
    path = "/v1/templates/{id}",
    params(("id" = Uuid, Path, description = "Template ID")),
    responses(
        (status = 204, description = "Template deleted"),
        (status = 404, description = "Template not found", body = engage_core::error::ApiError),
        (status = 409, description = "Template is used by a campaign", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "templates"
)]
pub async fn delete_template(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    user.require(Permission::ManageTemplates, "delete template")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let in_use: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM campaigns WHERE template_id = $1)")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
    if in_use {
        return Err(AppError::conflict(
            "Template is referenced by a campaign; disable it instead",
        ));
    }
    let deleted = sqlx::query("DELETE FROM message_templates WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    if deleted == 0 {
        return Err(AppError::not_found(format!("Template {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Render the template body with the given parameters
#[utoipa::path(
    post,
    path = "/v1/templates/{id}/preview",
    params(("id" = Uuid, Path, description = "Template ID")),
    request_body = PreviewTemplateRequest,
    responses(
        (status = 200, description = "Rendered body", body = PreviewTemplateResponse),
        (status = 400, description = "Too few parameters", body = engage_core::error::ApiError),
        (status = 404, description = "Template not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "templates"
)]
pub async fn preview_template(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<PreviewTemplateRequest>,
) -> Result<Json<PreviewTemplateResponse>, AppError> {
    require_read(&user, "preview template")?;
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let row = fetch_template(&mut tx, id).await?;
    tx.commit().await?;

    Ok(Json(PreviewTemplateResponse {
        rendered: render(&row.body, &req.params)?,
        placeholder_count: row.placeholder_count,
    }))
}
