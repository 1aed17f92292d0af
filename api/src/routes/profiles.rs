use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::auth::hash_password;
use engage_core::roles::{Permission, Role};

use crate::auth::AuthenticatedUser;
use crate::db::begin_tenant;
use crate::error::AppError;
use crate::extract::{AppJson, nullable};
use crate::state::AppState;

pub const MIN_PASSWORD_LEN: usize = 10;

#[derive(Serialize, utoipa::ToSchema)]
pub struct ProfileResponse {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub team_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateProfileRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub team_id: Option<Uuid>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub role: Option<Role>,
    /// `null` removes the profile from its team.
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<Uuid>)]
    pub team_id: Option<Option<Uuid>>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    email: String,
    full_name: Option<String>,
    role: String,
    team_id: Option<Uuid>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl ProfileRow {
    fn into_response(self) -> Result<ProfileResponse, AppError> {
        Ok(ProfileResponse {
            role: Role::parse(&self.role)?,
            id: self.id,
            email: self.email,
            full_name: self.full_name,
            team_id: self.team_id,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

const PROFILE_COLUMNS: &str = "id, email, full_name, role, team_id, is_active, created_at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/profiles", get(list_profiles).post(create_profile))
        .route("/v1/profiles/{id}", patch(update_profile))
}

/// Decide whether `actor` may apply `changes` to `target`. Pure so the rules
/// can be tested without a database.
pub fn check_profile_update(
    actor: &AuthenticatedUser,
    target_id: Uuid,
    target_role: Role,
    changes: &UpdateProfileRequest,
) -> Result<(), AppError> {
    let is_self = actor.profile_id == target_id;

    if !is_self && !actor.role.outranks(target_role) {
        return Err(AppError::forbidden(format!(
            "Role '{}' may not edit a profile with role '{target_role}'",
            actor.role
        )));
    }
    if let Some(role) = changes.role {
        if is_self && role != actor.role {
            return Err(AppError::forbidden("You cannot change your own role"));
        }
        if !is_self && !actor.role.can_assign(role) {
            return Err(AppError::forbidden(format!(
                "Role '{}' may not assign role '{role}'",
                actor.role
            )));
        }
    }
    if is_self && changes.is_active == Some(false) {
        return Err(AppError::forbidden("You cannot deactivate your own profile"));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<String, AppError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email.to_lowercase()),
        _ => Err(AppError::validation("email", "must be a valid email address")),
    }
}

async fn ensure_team(state: &AppState, organization_id: Uuid, team_id: Uuid) -> Result<(), AppError> {
    let mut tx = begin_tenant(&state.db, organization_id).await?;
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM teams WHERE id = $1)")
        .bind(team_id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    if exists {
        Ok(())
    } else {
        Err(AppError::not_found(format!("Team {team_id}")))
    }
}

/// List staff profiles of the organization
#[utoipa::path(
    get,
    path = "/v1/profiles",
    responses(
        (status = 200, description = "Profiles", body = Vec<ProfileResponse>),
        (status = 403, description = "Missing manage_users", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "profiles"
)]
pub async fn list_profiles(
    user: AuthenticatedUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<ProfileResponse>>, AppError> {
    user.require(Permission::ManageUsers, "list profiles")?;

    let rows = sqlx::query_as::<_, ProfileRow>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM profiles WHERE organization_id = $1 ORDER BY created_at, id"
    ))
    .bind(user.organization_id)
    .fetch_all(&state.db)
    .await?;

    let profiles = rows
        .into_iter()
        .map(ProfileRow::into_response)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(profiles))
}

/// Create a staff profile
#[utoipa::path(
    post,
    path = "/v1/profiles",
    request_body = CreateProfileRequest,
    responses(
        (status = 201, description = "Profile created", body = ProfileResponse),
        (status = 400, description = "Invalid input", body = engage_core::error::ApiError),
        (status = 403, description = "Role not assignable", body = engage_core::error::ApiError),
        (status = 409, description = "Email already in use", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "profiles"
)]
pub async fn create_profile(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateProfileRequest>,
) -> Result<(StatusCode, Json<ProfileResponse>), AppError> {
    user.require(Permission::ManageUsers, "create profile")?;
    if !user.role.can_assign(req.role) {
        return Err(AppError::forbidden(format!(
            "Role '{}' may not assign role '{}'",
            user.role, req.role
        )));
    }

    let email = validate_email(&req.email)?;
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    if let Some(team_id) = req.team_id {
        ensure_team(&state, user.organization_id, team_id).await?;
    }

    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AppError::Internal(format!("password hashing task failed: {e}")))?
        .map_err(AppError::Internal)?;

    let row = sqlx::query_as::<_, ProfileRow>(&format!(
        "INSERT INTO profiles (id, organization_id, email, password_hash, full_name, role, team_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {PROFILE_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(user.organization_id)
    .bind(&email)
    .bind(&password_hash)
    .bind(req.full_name.as_deref().map(str::trim))
    .bind(req.role.as_str())
    .bind(req.team_id)
    .fetch_one(&state.db)
    .await?;

    tracing::info!(
        actor = %user.profile_id,
        profile_id = %row.id,
        role = req.role.as_str(),
        "profile created"
    );
    Ok((StatusCode::CREATED, Json(row.into_response()?)))
}

/// Update role, team, name or active flag of a profile
#[utoipa::path(
    patch,
    path = "/v1/profiles/{id}",
    params(("id" = Uuid, Path, description = "Profile ID")),
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = ProfileResponse),
        (status = 403, description = "Change not permitted", body = engage_core::error::ApiError),
        (status = 404, description = "Profile not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "profiles"
)]
pub async fn update_profile(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<UpdateProfileRequest>,
) -> Result<Json<ProfileResponse>, AppError> {
    user.require(Permission::ManageUsers, "update profile")?;

    let target = sqlx::query_as::<_, ProfileRow>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1 AND organization_id = $2"
    ))
    .bind(id)
    .bind(user.organization_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Profile {id}")))?;

    check_profile_update(&user, id, Role::parse(&target.role)?, &req)?;
    if let Some(Some(team_id)) = req.team_id {
        ensure_team(&state, user.organization_id, team_id).await?;
    }

    let row = sqlx::query_as::<_, ProfileRow>(&format!(
        "UPDATE profiles SET \
             role = COALESCE($3, role), \
             team_id = CASE WHEN $4 THEN $5 ELSE team_id END, \
             full_name = COALESCE($6, full_name), \
             is_active = COALESCE($7, is_active), \
             updated_at = NOW() \
         WHERE id = $1 AND organization_id = $2 \
         RETURNING {PROFILE_COLUMNS}"
    ))
    .bind(id)
    .bind(user.organization_id)
    .bind(req.role.map(Role::as_str))
    .bind(req.team_id.is_some())
    .bind(req.team_id.flatten())
    .bind(req.full_name.as_deref().map(str::trim))
    .bind(req.is_active)
    .fetch_one(&state.db)
    .await?;

    if req.is_active == Some(false) {
        sqlx::query("UPDATE access_tokens SET is_revoked = TRUE WHERE profile_id = $1 AND NOT is_revoked")
            .bind(id)
            .execute(&state.db)
            .await?;
    }

    tracing::info!(actor = %user.profile_id, profile_id = %id, "profile updated");
    Ok(Json(row.into_response()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;

    fn actor(role: Role) -> AuthenticatedUser {
        AuthenticatedUser {
            profile_id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            role,
            team_id: None,
            auth_method: AuthMethod::ApiKey { key_id: Uuid::now_v7() },
        }
    }

    fn changes(role: Option<Role>, is_active: Option<bool>) -> UpdateProfileRequest {
        UpdateProfileRequest {
            role,
            team_id: None,
            full_name: None,
            is_active,
        }
    }

    #[test]
    fn cannot_demote_or_deactivate_self() {
        let admin = actor(Role::Admin);
        let own = admin.profile_id;
        assert!(check_profile_update(&admin, own, Role::Admin, &changes(Some(Role::Agent), None)).is_err());
        assert!(check_profile_update(&admin, own, Role::Admin, &changes(None, Some(false))).is_err());
        assert!(check_profile_update(&admin, own, Role::Admin, &changes(None, None)).is_ok());
    }

    #[test]
    fn general_manager_cannot_promote_to_own_rank() {
        let gm = actor(Role::GeneralManager);
        let target = Uuid::now_v7();
        assert!(check_profile_update(&gm, target, Role::Agent, &changes(Some(Role::TeamLeader), None)).is_ok());
        assert!(
            check_profile_update(&gm, target, Role::Agent, &changes(Some(Role::GeneralManager), None))
                .is_err()
        );
    }

    #[test]
    fn peers_cannot_edit_each_other() {
        let gm = actor(Role::GeneralManager);
        assert!(
            check_profile_update(&gm, Uuid::now_v7(), Role::GeneralManager, &changes(None, Some(false)))
                .is_err()
        );
    }

    #[test]
    fn email_is_normalized() {
        assert_eq!(validate_email(" Ana@Example.COM ").unwrap(), "ana@example.com");
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("@example.com").is_err());
    }
}
