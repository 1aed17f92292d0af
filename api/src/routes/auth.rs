use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::auth;
use engage_core::roles::Role;

use crate::auth::{AuthMethod, AuthenticatedUser};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

#[derive(Deserialize, utoipa::ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub profile: MeResponse,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct MeResponse {
    pub profile_id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub team_id: Option<Uuid>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct LogoutResponse {
    pub revoked: bool,
}

#[derive(sqlx::FromRow)]
struct LoginRow {
    id: Uuid,
    organization_id: Uuid,
    email: String,
    password_hash: String,
    full_name: Option<String>,
    role: String,
    team_id: Option<Uuid>,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    organization_id: Uuid,
    email: String,
    full_name: Option<String>,
    role: String,
    team_id: Option<Uuid>,
}

fn invalid_credentials() -> AppError {
    AppError::Unauthorized {
        message: "Invalid email or password".to_string(),
        docs_hint: None,
    }
}

/// Login routes carry their own per-IP rate limit.
pub fn login_router() -> Router<AppState> {
    Router::new().route("/v1/auth/login", post(login))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/auth/logout", post(logout))
        .route("/v1/auth/me", get(me))
}

/// Exchange email and password for a bearer access token
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Access token issued", body = LoginResponse),
        (status = 400, description = "Malformed request", body = engage_core::error::ApiError),
        (status = 401, description = "Invalid credentials", body = engage_core::error::ApiError),
        (status = 429, description = "Too many login attempts", body = engage_core::error::ApiError)
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<AppState>,
    AppJson(req): AppJson<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let email = req.email.trim();
    if email.is_empty() || req.password.is_empty() {
        return Err(AppError::validation("email", "email and password are required"));
    }

    let row = sqlx::query_as::<_, LoginRow>(
        "SELECT id, organization_id, email, password_hash, full_name, role, team_id, is_active \
         FROM profiles WHERE lower(email) = lower($1)",
    )
    .bind(email)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(invalid_credentials)?;

    let password = req.password;
    let password_hash = row.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || auth::verify_password(&password, &password_hash))
        .await
        .map_err(|e| AppError::Internal(format!("password verification task failed: {e}")))?
        .map_err(AppError::Internal)?;

    if !valid || !row.is_active {
        tracing::warn!(profile_id = %row.id, active = row.is_active, "login rejected");
        return Err(invalid_credentials());
    }

    let role = Role::parse(&row.role)?;
    let (token, token_hash) = auth::generate_access_token();
    let expires_at = Utc::now() + state.config.access_token_ttl();

    sqlx::query(
        "INSERT INTO access_tokens (id, profile_id, token_hash, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::now_v7())
    .bind(row.id)
    .bind(&token_hash)
    .bind(expires_at)
    .execute(&state.db)
    .await?;

    tracing::info!(profile_id = %row.id, organization_id = %row.organization_id, "login");

    Ok(Json(LoginResponse {
        access_token: token,
        token_type: "Bearer".to_string(),
        expires_at,
        profile: MeResponse {
            profile_id: row.id,
            organization_id: row.organization_id,
            email: row.email,
            full_name: row.full_name,
            role,
            team_id: row.team_id,
        },
    }))
}

/// Revoke the access token used for this request
#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 200, description = "Token revoked", body = LogoutResponse),
        (status = 400, description = "API keys cannot log out", body = engage_core::error::ApiError),
        (status = 401, description = "Not authenticated", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn logout(
    user: AuthenticatedUser,
    State(state): State<AppState>,
) -> Result<Json<LogoutResponse>, AppError> {
    let AuthMethod::AccessToken { token_id } = user.auth_method else {
        return Err(AppError::Validation {
            message: "API keys are long-lived and cannot be logged out".to_string(),
            field: Some("authorization".to_string()),
            received: None,
            docs_hint: Some("Revoke the key in the api_keys table instead.".to_string()),
        });
    };

    let revoked = sqlx::query("UPDATE access_tokens SET is_revoked = TRUE WHERE id = $1 AND NOT is_revoked")
        .bind(token_id)
        .execute(&state.db)
        .await?
        .rows_affected();

    tracing::info!(profile_id = %user.profile_id, token_id = %token_id, "logout");
    Ok(Json(LogoutResponse { revoked: revoked > 0 }))
}

/// The authenticated profile
#[utoipa::path(
    get,
    path = "/v1/auth/me",
    responses(
        (status = 200, description = "Current profile", body = MeResponse),
        (status = 401, description = "Not authenticated", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn me(
    user: AuthenticatedUser,
    State(state): State<AppState>,
) -> Result<Json<MeResponse>, AppError> {
    let row = sqlx::query_as::<_, ProfileRow>(
        "SELECT id, organization_id, email, full_name, role, team_id FROM profiles WHERE id = $1",
    )
    .bind(user.profile_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::not_found("Profile"))?;

    Ok(Json(MeResponse {
        profile_id: row.id,
        organization_id: row.organization_id,
        email: row.email,
        full_name: row.full_name,
        role: Role::parse(&row.role)?,
        team_id: row.team_id,
    }))
}
