use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::roles::Permission;

use crate::auth::AuthenticatedUser;
use crate::db::begin_tenant;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct TeamResponse {
    pub id: Uuid,
    pub name: String,
    pub member_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TeamRequest {
    pub name: String,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct TeamMembershipResponse {
    pub team_id: Uuid,
    pub profile_id: Uuid,
    pub is_member: bool,
}

const TEAM_SELECT: &str = "SELECT t.id, t.name, t.created_at, \
     (SELECT COUNT(*) FROM profiles p WHERE p.team_id = t.id) AS member_count \
     FROM teams t";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/teams", get(list_teams).post(create_team))
        .route("/v1/teams/{id}", patch(rename_team).delete(delete_team))
        .route(
            "/v1/teams/{id}/members/{profile_id}",
            put(add_member).delete(remove_member),
        )
}

fn team_name(raw: &str) -> Result<String, AppError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > 120 {
        return Err(AppError::validation("name", "must be 1 to 120 characters"));
    }
    Ok(name.to_string())
}

/// List the organization's teams
#[utoipa::path(
    get,
    path = "/v1/teams",
    responses((status = 200, description = "Teams", body = Vec<TeamResponse>)),
    security(("bearer_auth" = [])),
    tag = "teams"
)]
pub async fn list_teams(
    user: AuthenticatedUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<TeamResponse>>, AppError> {
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let teams = sqlx::query_as::<_, TeamResponse>(&format!("{TEAM_SELECT} ORDER BY t.name"))
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Json(teams))
}

/// Create a team
#[utoipa::path(
    post,
    path = "/v1/teams",
    request_body = TeamRequest,
    responses(
        (status = 201, description = "Team created", body = TeamResponse),
        (status = 409, description = "Name already taken", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "teams"
)]
pub async fn create_team(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<TeamRequest>,
) -> Result<(StatusCode, Json<TeamResponse>), AppError> {
    user.require(Permission::ManageTeams, "create team")?;
    let name = team_name(&req.name)?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let team = sqlx::query_as::<_, TeamResponse>(
        "INSERT INTO teams (id, organization_id, name) VALUES ($1, $2, $3) \
         RETURNING id, name, created_at, 0::BIGINT AS member_count",
    )
    .bind(Uuid::now_v7())
    .bind(user.organization_id)
    .bind(&name)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(team_id = %team.id, actor = %user.profile_id, "team created");
    Ok((StatusCode::CREATED, Json(team)))
}

/// Rename a team
#[utoipa::path(
    patch,
    path = "/v1/teams/{id}",
    params(("id" = Uuid, Path, description = "Team ID")),
    request_body = TeamRequest,
    responses(
        (status = 200, description = "Team renamed", body = TeamResponse),
        (status = 404, description = "Team not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "teams"
)]
pub async fn rename_team(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<TeamRequest>,
) -> Result<Json<TeamResponse>, AppError> {
    user.require(Permission::ManageTeams, "rename team")?;
    let name = team_name(&req.name)?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let updated = sqlx::query("UPDATE teams SET name = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(&name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(AppError::not_found(format!("Team {id}")));
    }
    let team = sqlx::query_as::<_, TeamResponse>(&format!("{TEAM_SELECT} WHERE t.id = $1"))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Json(team))
}

/// Delete a team; its members become teamless
#[utoipa::path(
    delete,
    path = "/v1/teams/{id}",
    params(("id" = Uuid, Path, description = "Team ID")),
    responses(
        (status = 204, description = "Team deleted"),
        (status = 404, description = "Team not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "teams"
)]
pub async fn delete_team(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    user.require(Permission::ManageTeams, "delete team")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let deleted = sqlx::query("DELETE FROM teams WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    if deleted == 0 {
        return Err(AppError::not_found(format!("Team {id}")));
    }
    tracing::info!(team_id = %id, actor = %user.profile_id, "team deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Move a profile into the team
#[utoipa::path(
    put,
    path = "/v1/teams/{id}/members/{profile_id}",
    params(
        ("id" = Uuid, Path, description = "Team ID"),
        ("profile_id" = Uuid, Path, description = "Profile ID")
    ),
    responses(
        (status = 200, description = "Profile is a member", body = TeamMembershipResponse),
        (status = 404, description = "Team or profile not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "teams"
)]
pub async fn add_member(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path((id, profile_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TeamMembershipResponse>, AppError> {
    user.require(Permission::ManageTeams, "add team member")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let team_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM teams WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    if !team_exists {
        return Err(AppError::not_found(format!("Team {id}")));
    }
    let updated = sqlx::query(
        "UPDATE profiles SET team_id = $1, updated_at = NOW() WHERE id = $2 AND organization_id = $3",
    )
    .bind(id)
    .bind(profile_id)
    .bind(user.organization_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::not_found(format!("Profile {profile_id}")));
    }
    tx.commit().await?;

    Ok(Json(TeamMembershipResponse {
        team_id: id,
        profile_id,
        is_member: true,
    }))
}

/// Remove a profile from the team
#[utoipa::path(
    delete,
    path = "/v1/teams/{id}/members/{profile_id}",
    params(
        ("id" = Uuid, Path, description = "Team ID"),
        ("profile_id" = Uuid, Path, description = "Profile ID")
    ),
    responses(
        (status = 200, description = "Profile is no longer a member", body = TeamMembershipResponse),
        (status = 404, description = "Profile is not in this team", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "teams"
)]
pub async fn remove_member(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path((id, profile_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TeamMembershipResponse>, AppError> {
    user.require(Permission::ManageTeams, "remove team member")?;

    let updated = sqlx::query(
        "UPDATE profiles SET team_id = NULL, updated_at = NOW() \
         WHERE id = $1 AND team_id = $2 AND organization_id = $3",
    )
    .bind(profile_id)
    .bind(id)
    .bind(user.organization_id)
    .execute(&state.db)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AppError::not_found(format!("Member {profile_id} of team {id}")));
    }

    Ok(Json(TeamMembershipResponse {
        team_id: id,
        profile_id,
        is_member: false,
    }))
}
