use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use engage_core::contacts::wa_id;
use engage_core::pagination::{PaginatedResponse, clamp_limit, decode_cursor};
use engage_core::roles::{ConversationScope, Permission, Role};
use engage_core::templates::{TemplateStatus, render};
use engage_core::window::{ConversationStatus, SendDecision, SendKind, WindowState};

use crate::auth::AuthenticatedUser;
use crate::db::begin_tenant;
use crate::error::AppError;
use crate::extract::{AppJson, AppQuery};
use crate::gateway::{GatewayError, OutboundTemplate, OutboundText};
use crate::ingest;
use crate::state::{AppState, try_acquire_send};

pub const MAX_TEXT_LEN: usize = 4096;

#[derive(Serialize, utoipa::ToSchema)]
pub struct WindowInfo {
    /// Whether a free-form message may be sent right now
    pub is_open: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub contact_name: Option<String>,
    pub contact_phone: String,
    /// `open` is reported as `expired` as soon as the window lapses, even
    /// before the sweeper persists it.
    pub status: ConversationStatus,
    pub assigned_to: Option<Uuid>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub last_message_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub window: WindowInfo,
}

#[derive(Serialize, sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    contact_id: Uuid,
    contact_name: Option<String>,
    contact_phone: String,
    status: String,
    assigned_to: Option<Uuid>,
    last_inbound_at: Option<DateTime<Utc>>,
    last_outbound_at: Option<DateTime<Utc>>,
    window_expires_at: Option<DateTime<Utc>>,
    last_message_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ConversationRow {
    fn window_state(&self) -> Result<WindowState, AppError> {
        Ok(WindowState {
            status: ConversationStatus::parse(&self.status)?,
            last_inbound_at: self.last_inbound_at,
            window_expires_at: self.window_expires_at,
        })
    }

    fn into_response(self, now: DateTime<Utc>) -> Result<ConversationResponse, AppError> {
        let window = self.window_state()?;
        Ok(ConversationResponse {
            id: self.id,
            contact_id: self.contact_id,
            contact_name: self.contact_name,
            contact_phone: self.contact_phone,
            status: window.effective_status(now),
            assigned_to: self.assigned_to,
            last_inbound_at: self.last_inbound_at,
            last_outbound_at: self.last_outbound_at,
            last_message_at: self.last_message_at,
            closed_at: self.closed_at,
            created_at: self.created_at,
            window: WindowInfo {
                is_open: window.can_send(SendKind::FreeForm, now).is_allowed(),
                expires_at: window.window_expires_at,
                remaining_seconds: window.remaining(now).map(|d| d.num_seconds()),
            },
        })
    }
}

const CONVERSATION_SELECT: &str = "SELECT c.id, c.contact_id, ct.name AS contact_name, ct.phone_e164 AS contact_phone, \
     c.status, c.assigned_to, c.last_inbound_at, c.last_outbound_at, c.window_expires_at, \
     c.last_message_at, c.closed_at, c.created_at \
     FROM conversations c JOIN contacts ct ON ct.id = c.contact_id";

/// SQL predicate over `c` restricting rows to a scope, bound at `$n` (kind)
/// and `$n+1` (profile or team id).
fn scope_predicate(first_param: usize) -> String {
    let kind = first_param;
    let id = first_param + 1;
    format!(
        "(${kind} = 'all' \
          OR (${kind} = 'own' AND c.assigned_to = ${id}) \
          OR (${kind} = 'team' AND (c.assigned_to IS NULL \
              OR c.assigned_to IN (SELECT p.id FROM profiles p WHERE p.team_id = ${id}))))"
    )
}

fn scope_binds(scope: ConversationScope) -> (&'static str, Option<Uuid>) {
    match scope {
        ConversationScope::All => ("all", None),
        ConversationScope::Own(profile_id) => ("own", Some(profile_id)),
        ConversationScope::Team(team_id) => ("team", Some(team_id)),
    }
}

#[derive(Deserialize, utoipa::IntoParams)]
pub struct ListConversationsParams {
    pub status: Option<String>,
    /// Only conversations assigned to this profile
    pub assigned_to: Option<Uuid>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize, utoipa::IntoParams)]
pub struct ListMessagesParams {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct MessageResponse {
    pub id: Uuid,
    pub direction: String,
    pub kind: String,
    pub body: Option<String>,
    pub template_id: Option<Uuid>,
    pub provider_message_id: Option<String>,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub sent_by: Option<Uuid>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str = "id, direction, kind, body, template_id, provider_message_id, status, error_code, \
     error_message, sent_by, sent_at, delivered_at, read_at, failed_at, created_at";

/// Free-form text needs an open customer window; approved templates can be
/// sent at any time while the conversation is not closed.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SendMessageRequest {
    Text {
        body: String,
    },
    Template {
        template_id: Uuid,
        #[serde(default)]
        params: Vec<String>,
    },
}

impl SendMessageRequest {
    fn kind(&self) -> SendKind {
        match self {
            SendMessageRequest::Text { .. } => SendKind::FreeForm,
            SendMessageRequest::Template { .. } => SendKind::Template,
        }
    }
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AssignConversationRequest {
    /// `null` unassigns
    pub profile_id: Option<Uuid>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/conversations", get(list_conversations))
        .route("/v1/conversations/{id}", get(get_conversation))
        .route(
            "/v1/conversations/{id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/v1/conversations/{id}/assign", post(assign_conversation))
        .route("/v1/conversations/{id}/close", post(close_conversation))
}

/// Load a conversation the caller may see; anything outside the scope is
/// reported as missing.
async fn fetch_scoped(
    conn: &mut PgConnection,
    user: &AuthenticatedUser,
    id: Uuid,
    for_update: bool,
) -> Result<ConversationRow, AppError> {
    let (kind, scope_id) = scope_binds(user.conversation_scope());
    let lock = if for_update { " FOR UPDATE OF c" } else { "" };
    sqlx::query_as::<_, ConversationRow>(&format!(
        "{CONVERSATION_SELECT} WHERE c.id = $1 AND {}{lock}",
        scope_predicate(2)
    ))
    .bind(id)
    .bind(kind)
    .bind(scope_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Conversation {id}")))
}

/// List conversations visible to the caller, most recent activity first
#[utoipa::path(
    get,
    path = "/v1/conversations",
    params(ListConversationsParams),
    responses((status = 200, description = "Page of conversations", body = PaginatedResponse<ConversationResponse>)),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn list_conversations(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppQuery(params): AppQuery<ListConversationsParams>,
) -> Result<Json<PaginatedResponse<ConversationResponse>>, AppError> {
    let limit = clamp_limit(params.limit);
    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;
    let status = params
        .status
        .as_deref()
        .map(ConversationStatus::parse)
        .transpose()?;
    let (kind, scope_id) = scope_binds(user.conversation_scope());

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let rows = sqlx::query_as::<_, ConversationRow>(&format!(
        "{CONVERSATION_SELECT} \
         WHERE ($1::timestamptz IS NULL OR (c.last_message_at, c.id) < ($1, $2)) \
           AND ($3::text IS NULL OR c.status = $3) \
           AND ($4::uuid IS NULL OR c.assigned_to = $4) \
           AND {} \
         ORDER BY c.last_message_at DESC, c.id DESC LIMIT $7",
        scope_predicate(5)
    ))
    .bind(cursor.map(|c| c.timestamp))
    .bind(cursor.map(|c| c.id))
    .bind(status.map(ConversationStatus::as_str))
    .bind(params.assigned_to)
    .bind(kind)
    .bind(scope_id)
    .bind(limit + 1)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    let page = PaginatedResponse::from_rows(rows, limit, |c| (c.last_message_at, c.id));
    let now = Utc::now();
    Ok(Json(PaginatedResponse {
        data: page
            .data
            .into_iter()
            .map(|row| row.into_response(now))
            .collect::<Result<Vec<_>, _>>()?,
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

/// Get a conversation with its window state
#[utoipa::path(
    get,
    path = "/v1/conversations/{id}",
    params(("id" = Uuid, Path, description = "Conversation ID")),
    responses(
        (status = 200, description = "Conversation", body = ConversationResponse),
        (status = 404, description = "Not found or not visible", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn get_conversation(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationResponse>, AppError> {
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let row = fetch_scoped(&mut tx, &user, id, false).await?;
    tx.commit().await?;
    Ok(Json(row.into_response(Utc::now())?))
}

/// Messages of a conversation, newest first
#[utoipa::path(
    get,
    path = "/v1/conversations/{id}/messages",
    params(("id" = Uuid, Path, description = "Conversation ID"), ListMessagesParams),
    responses(
        (status = 200, description = "Page of messages", body = PaginatedResponse<MessageResponse>),
        (status = 404, description = "Not found or not visible", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn list_messages(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppQuery(params): AppQuery<ListMessagesParams>,
) -> Result<Json<PaginatedResponse<MessageResponse>>, AppError> {
    let limit = clamp_limit(params.limit);
    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    fetch_scoped(&mut tx, &user, id, false).await?;
    let rows = sqlx::query_as::<_, MessageResponse>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE conversation_id = $1 \
           AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3)) \
         ORDER BY created_at DESC, id DESC LIMIT $4"
    ))
    .bind(id)
    .bind(cursor.map(|c| c.timestamp))
    .bind(cursor.map(|c| c.id))
    .bind(limit + 1)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(PaginatedResponse::from_rows(rows, limit, |m| {
        (m.created_at, m.id)
    })))
}

#[derive(sqlx::FromRow)]
struct SendTemplateRow {
    name: String,
    language: String,
    body: String,
    status: String,
    placeholder_count: i32,
}

/// What the gateway is asked to deliver, resolved before any network call.
enum PreparedSend {
    Text(OutboundText),
    Template {
        message: OutboundTemplate,
        template_id: Uuid,
        rendered: String,
    },
}

/// Send a reply
#[utoipa::path(
    post,
    path = "/v1/conversations/{id}/messages",
    params(("id" = Uuid, Path, description = "Conversation ID")),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message accepted by the gateway", body = MessageResponse),
        (status = 404, description = "Not found or not visible", body = engage_core::error::ApiError),
        (status = 409, description = "window_expired, no_inbound_message or conversation_closed", body = engage_core::error::ApiError),
        (status = 429, description = "Send budget spent or gateway throttling", body = engage_core::error::ApiError),
        (status = 502, description = "Gateway error", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn send_message(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    user.require(Permission::ReplyConversations, "send message")?;
    if let SendMessageRequest::Text { body } = &req {
        let len = body.chars().count();
        if body.trim().is_empty() || len > MAX_TEXT_LEN {
            return Err(AppError::validation(
                "body",
                format!("must be 1 to {MAX_TEXT_LEN} characters"),
            ));
        }
    }

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let conversation = fetch_scoped(&mut tx, &user, id, false).await?;
    if let SendDecision::Blocked(reason) = conversation
        .window_state()?
        .can_send(req.kind(), Utc::now())
    {
        return Err(AppError::WindowClosed(reason));
    }

    let phone_number_id: Option<String> =
        sqlx::query_scalar("SELECT whatsapp_phone_number_id FROM organizations WHERE id = $1")
            .bind(user.organization_id)
            .fetch_one(&mut *tx)
            .await?;
    let phone_number_id = phone_number_id.ok_or_else(|| {
        AppError::conflict("The organization has no WhatsApp phone number configured")
    })?;
    let to = wa_id(&conversation.contact_phone).to_string();

    let prepared = match req {
        SendMessageRequest::Text { body } => PreparedSend::Text(OutboundText {
            phone_number_id,
            to,
            body,
        }),
        SendMessageRequest::Template { template_id, params } => {
            let template = sqlx::query_as::<_, SendTemplateRow>(
                "SELECT name, language, body, status, placeholder_count FROM message_templates WHERE id = $1",
            )
            .bind(template_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Template {template_id}")))?;
            if !TemplateStatus::parse(&template.status)?.is_sendable() {
                return Err(AppError::conflict(format!(
                    "Template '{}' is {}, only approved templates can be sent",
                    template.name, template.status
                )));
            }
            if template.placeholder_count as usize != params.len() {
                return Err(AppError::validation(
                    "params",
                    format!(
                        "template '{}' takes {} parameters, got {}",
                        template.name,
                        template.placeholder_count,
                        params.len()
                    ),
                ));
            }
            PreparedSend::Template {
                rendered: render(&template.body, &params)?,
                template_id,
                message: OutboundTemplate {
                    phone_number_id,
                    to,
                    template_name: template.name,
                    language: template.language,
                    params,
                },
            }
        }
    };
    tx.commit().await?;

    // A live reply never queues behind a running campaign.
    try_acquire_send(&state.send_limiter).map_err(|retry_after_secs| AppError::RateLimited {
        retry_after_secs: Some(retry_after_secs),
    })?;
    let sent = match &prepared {
        PreparedSend::Text(message) => state.gateway.send_text(message).await,
        PreparedSend::Template { message, .. } => state.gateway.send_template(message).await,
    };
    let receipt = sent.map_err(|err| match err {
        GatewayError::RateLimited { retry_after } => AppError::RateLimited {
            retry_after_secs: retry_after.map(|d| d.num_seconds().max(1) as u64),
        },
        other => AppError::Gateway(other),
    })?;

    let (kind, body, template_id) = match prepared {
        PreparedSend::Text(message) => ("text", message.body, None),
        PreparedSend::Template {
            rendered,
            template_id,
            ..
        } => ("template", rendered, Some(template_id)),
    };

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let message = sqlx::query_as::<_, MessageResponse>(&format!(
        "INSERT INTO messages \
             (id, organization_id, conversation_id, direction, kind, body, template_id, \
              provider_message_id, status, sent_by, sent_at) \
         VALUES ($1, $2, $3, 'outbound', $4, $5, $6, $7, 'sent', $8, NOW()) \
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(user.organization_id)
    .bind(id)
    .bind(kind)
    .bind(&body)
    .bind(template_id)
    .bind(&receipt.provider_message_id)
    .bind(user.profile_id)
    .fetch_one(&mut *tx)
    .await?;
    let replay = ingest::reapply_parked(&mut tx, std::slice::from_ref(&receipt.provider_message_id)).await?;
    let message = if replay.applied > 0 {
        sqlx::query_as::<_, MessageResponse>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(message.id)
        .fetch_one(&mut *tx)
        .await?
    } else {
        message
    };
    sqlx::query(
        "UPDATE conversations SET last_outbound_at = NOW(), last_message_at = NOW(), updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(
        conversation_id = %id,
        profile_id = %user.profile_id,
        kind,
        provider_message_id = %receipt.provider_message_id,
        "reply sent"
    );
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(sqlx::FromRow)]
struct AssigneeRow {
    role: String,
    team_id: Option<Uuid>,
    is_active: bool,
}

/// Check that `assignee` may receive conversations from `actor`.
fn check_assignee(
    actor: &AuthenticatedUser,
    assignee_role: Role,
    assignee_team: Option<Uuid>,
    assignee_active: bool,
) -> Result<(), AppError> {
    if !assignee_active {
        return Err(AppError::validation("profile_id", "assignee is deactivated"));
    }
    if actor.role == Role::TeamLeader
        && (actor.team_id.is_none() || assignee_team != actor.team_id)
    {
        return Err(AppError::forbidden(
            "Team leaders can only assign conversations within their own team",
        ));
    }
    if !assignee_role.can(Permission::ReplyConversations) {
        return Err(AppError::validation("profile_id", "assignee cannot reply to conversations"));
    }
    Ok(())
}

/// Assign or unassign a conversation
#[utoipa::path(
    post,
    path = "/v1/conversations/{id}/assign",
    params(("id" = Uuid, Path, description = "Conversation ID")),
    request_body = AssignConversationRequest,
    responses(
        (status = 200, description = "Assignment updated", body = ConversationResponse),
        (status = 403, description = "Assignee outside the caller's team", body = engage_core::error::ApiError),
        (status = 404, description = "Conversation or profile not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn assign_conversation(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<AssignConversationRequest>,
) -> Result<Json<ConversationResponse>, AppError> {
    user.require(Permission::AssignConversations, "assign conversation")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    fetch_scoped(&mut tx, &user, id, true).await?;
    if let Some(profile_id) = req.profile_id {
        let assignee = sqlx::query_as::<_, AssigneeRow>(
            "SELECT role, team_id, is_active FROM profiles WHERE id = $1 AND organization_id = $2",
        )
        .bind(profile_id)
        .bind(user.organization_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Profile {profile_id}")))?;
        check_assignee(
            &user,
            Role::parse(&assignee.role)?,
            assignee.team_id,
            assignee.is_active,
        )?;
    }

    sqlx::query("UPDATE conversations SET assigned_to = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(req.profile_id)
        .execute(&mut *tx)
        .await?;
    let row = sqlx::query_as::<_, ConversationRow>(&format!("{CONVERSATION_SELECT} WHERE c.id = $1"))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(
        conversation_id = %id,
        actor = %user.profile_id,
        assignee = ?req.profile_id,
        "conversation assigned"
    );
    Ok(Json(row.into_response(Utc::now())?))
}

/// Close a conversation; the next inbound message opens a new one
#[utoipa::path(
    post,
    path = "/v1/conversations/{id}/close",
    params(("id" = Uuid, Path, description = "Conversation ID")),
    responses(
        (status = 200, description = "Conversation closed", body = ConversationResponse),
        (status = 404, description = "Not found or not visible", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn close_conversation(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationResponse>, AppError> {
    user.require(Permission::CloseConversations, "close conversation")?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let current = fetch_scoped(&mut tx, &user, id, true).await?;
    let mut window = current.window_state()?;
    if window.status != ConversationStatus::Closed {
        window.close();
        sqlx::query(
            "UPDATE conversations SET status = $2, closed_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(window.status.as_str())
        .execute(&mut *tx)
        .await?;
        tracing::info!(conversation_id = %id, actor = %user.profile_id, "conversation closed");
    }
    let row = sqlx::query_as::<_, ConversationRow>(&format!("{CONVERSATION_SELECT} WHERE c.id = $1"))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Json(row.into_response(Utc::now())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use chrono::{Duration, TimeZone};

    fn user(role: Role, team_id: Option<Uuid>) -> AuthenticatedUser {
        AuthenticatedUser {
            profile_id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            role,
            team_id,
            auth_method: AuthMethod::ApiKey { key_id: Uuid::now_v7() },
        }
    }

    fn row(status: &str, last_inbound_at: Option<DateTime<Utc>>) -> ConversationRow {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        ConversationRow {
            id: Uuid::now_v7(),
            contact_id: Uuid::now_v7(),
            contact_name: Some("Ana".to_string()),
            contact_phone: "+4915123456789".to_string(),
            status: status.to_string(),
            assigned_to: None,
            last_inbound_at,
            last_outbound_at: None,
            window_expires_at: last_inbound_at.map(|at| at + Duration::hours(24)),
            last_message_at: created,
            closed_at: None,
            created_at: created,
        }
    }

    #[test]
    fn response_reports_lapsed_window_as_expired() {
        let inbound = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let open = row("open", Some(inbound))
            .into_response(inbound + Duration::hours(2))
            .unwrap();
        assert_eq!(open.status, ConversationStatus::Open);
        assert!(open.window.is_open);
        assert_eq!(open.window.remaining_seconds, Some(22 * 3600));

        let lapsed = row("open", Some(inbound))
            .into_response(inbound + Duration::hours(25))
            .unwrap();
        assert_eq!(lapsed.status, ConversationStatus::Expired);
        assert!(!lapsed.window.is_open);
        assert_eq!(lapsed.window.remaining_seconds, None);
    }

    #[test]
    fn business_initiated_conversation_has_no_window() {
        let response = row("open", None).into_response(Utc::now()).unwrap();
        assert!(!response.window.is_open);
        assert_eq!(response.window.expires_at, None);
    }

    #[test]
    fn send_request_is_tagged_by_type() {
        let text: SendMessageRequest =
            serde_json::from_str(r#"{"type": "text", "body": "hi"}"#).unwrap();
        assert_eq!(text.kind(), SendKind::FreeForm);
        let template: SendMessageRequest = serde_json::from_str(
            r#"{"type": "template", "template_id": "0191d3b4-7c1a-7000-8000-000000000001", "params": ["Ana"]}"#,
        )
        .unwrap();
        assert_eq!(template.kind(), SendKind::Template);
        assert!(serde_json::from_str::<SendMessageRequest>(r#"{"type": "sticker"}"#).is_err());
    }

    #[test]
    fn team_leader_assigns_only_within_team() {
        let team = Uuid::now_v7();
        let leader = user(Role::TeamLeader, Some(team));
        assert!(check_assignee(&leader, Role::Agent, Some(team), true).is_ok());
        assert!(check_assignee(&leader, Role::Agent, Some(Uuid::now_v7()), true).is_err());
        assert!(check_assignee(&leader, Role::Agent, None, true).is_err());

        let teamless_leader = user(Role::TeamLeader, None);
        assert!(check_assignee(&teamless_leader, Role::Agent, None, true).is_err());
    }

    #[test]
    fn inactive_assignee_is_rejected() {
        let manager = user(Role::GeneralManager, None);
        assert!(check_assignee(&manager, Role::Agent, None, false).is_err());
        assert!(check_assignee(&manager, Role::Agent, None, true).is_ok());
    }

    #[test]
    fn scope_predicate_numbers_parameters() {
        let sql = scope_predicate(5);
        assert!(sql.contains("$5 = 'all'"));
        assert!(sql.contains("c.assigned_to = $6"));
        assert!(!sql.contains("$7"));
    }
}
