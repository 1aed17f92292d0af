use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use engage_core::auth::{ACCESS_TOKEN_PREFIX, API_KEY_PREFIX, hash_token};
use engage_core::roles::{ConversationScope, Permission, Role, conversation_scope};

use crate::error::AppError;
use crate::state::AppState;

/// Staff profile resolved from the `Authorization: Bearer <token>` header.
///
/// Two-phase resolution:
/// 1. `InjectAuthLayer` validates the token once and stores the profile in
///    request extensions
/// 2. The extractor reads it back (no DB hit), or authenticates itself when
///    the layer did not run
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub profile_id: Uuid,
    pub organization_id: Uuid,
    pub role: Role,
    pub team_id: Option<Uuid>,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone)]
pub enum AuthMethod {
    ApiKey { key_id: Uuid },
    AccessToken { token_id: Uuid },
}

impl AuthenticatedUser {
    pub fn require(&self, permission: Permission, operation: &str) -> Result<(), AppError> {
        if self.role.can(permission) {
            return Ok(());
        }
        tracing::warn!(
            profile_id = %self.profile_id,
            role = %self.role,
            permission = permission.as_str(),
            operation = operation,
            decision = "deny",
            "permission check"
        );
        Err(AppError::Forbidden {
            message: format!(
                "Role '{}' may not perform '{operation}'",
                self.role
            ),
            docs_hint: Some(format!("Requires the '{}' permission.", permission.as_str())),
        })
    }

    pub fn conversation_scope(&self) -> ConversationScope {
        conversation_scope(self.role, self.profile_id, self.team_id)
    }
}

// --- Tower Layer/Service for auth injection ---

/// Injects `AuthenticatedUser` into request extensions. Unauthenticated
/// requests pass through untouched (health, login, webhooks).
#[derive(Clone)]
pub struct InjectAuthLayer {
    pool: sqlx::PgPool,
}

impl InjectAuthLayer {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

impl<S> Layer<S> for InjectAuthLayer {
    type Service = InjectAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectAuthService {
            inner,
            pool: self.pool.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InjectAuthService<S> {
    inner: S,
    pool: sqlx::PgPool,
}

impl<S> Service<Request> for InjectAuthService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let pool = self.pool.clone();

        let token = bearer_token(req.headers()).map(str::to_owned);

        Box::pin(async move {
            if let Some(token) = token {
                if let Ok(user) = authenticate_token(&token, &pool).await {
                    req.extensions_mut().insert(user);
                }
            }
            Ok(ready.oneshot(req).await.into_response())
        })
    }
}

pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }

        let token = bearer_token(&parts.headers).ok_or_else(|| AppError::Unauthorized {
            message: "Missing or malformed Authorization header".to_string(),
            docs_hint: Some(format!(
                "Send 'Authorization: Bearer <token>' with a login token ({ACCESS_TOKEN_PREFIX}...) \
                 or an API key ({API_KEY_PREFIX}...)."
            )),
        })?;

        authenticate_token(token, &state.db).await
    }
}

async fn authenticate_token(token: &str, pool: &sqlx::PgPool) -> Result<AuthenticatedUser, AppError> {
    if token.starts_with(API_KEY_PREFIX) {
        authenticate_api_key(token, pool).await
    } else if token.starts_with(ACCESS_TOKEN_PREFIX) {
        authenticate_access_token(token, pool).await
    } else {
        Err(AppError::Unauthorized {
            message: "Invalid token format".to_string(),
            docs_hint: Some(format!(
                "Token must start with '{API_KEY_PREFIX}' (API key) or '{ACCESS_TOKEN_PREFIX}' (login token)."
            )),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    credential_id: Uuid,
    profile_id: Uuid,
    organization_id: Uuid,
    role: String,
    team_id: Option<Uuid>,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl CredentialRow {
    fn into_user(self, auth_method: AuthMethod) -> Result<AuthenticatedUser, AppError> {
        let role = Role::parse(&self.role)
            .map_err(|e| AppError::Internal(format!("profile {} has {e}", self.profile_id)))?;
        Ok(AuthenticatedUser {
            profile_id: self.profile_id,
            organization_id: self.organization_id,
            role,
            team_id: self.team_id,
            auth_method,
        })
    }
}

fn expired(expires_at: Option<chrono::DateTime<Utc>>) -> bool {
    expires_at.is_some_and(|at| Utc::now() >= at)
}

async fn authenticate_api_key(token: &str, pool: &sqlx::PgPool) -> Result<AuthenticatedUser, AppError> {
    let row = sqlx::query_as::<_, CredentialRow>(
        "SELECT ak.id AS credential_id, p.id AS profile_id, p.organization_id, p.role, p.team_id, ak.expires_at \
         FROM api_keys ak \
         JOIN profiles p ON p.id = ak.profile_id \
         WHERE ak.key_hash = $1 \
           AND ak.is_revoked = FALSE \
           AND p.is_active = TRUE",
    )
    .bind(hash_token(token))
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Unauthorized {
        message: "Invalid API key".to_string(),
        docs_hint: Some("Check that the API key is correct and has not been revoked.".to_string()),
    })?;

    if expired(row.expires_at) {
        return Err(AppError::Unauthorized {
            message: "API key has expired".to_string(),
            docs_hint: Some("Create a new key with 'engage admin create-key'.".to_string()),
        });
    }

    let pool = pool.clone();
    let key_id = row.credential_id;
    tokio::spawn(async move {
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&pool)
            .await;
    });

    row.into_user(AuthMethod::ApiKey { key_id })
}

async fn authenticate_access_token(
    token: &str,
    pool: &sqlx::PgPool,
) -> Result<AuthenticatedUser, AppError> {
    let row = sqlx::query_as::<_, CredentialRow>(
        "SELECT t.id AS credential_id, p.id AS profile_id, p.organization_id, p.role, p.team_id, t.expires_at \
         FROM access_tokens t \
         JOIN profiles p ON p.id = t.profile_id \
         WHERE t.token_hash = $1 \
           AND t.is_revoked = FALSE \
           AND p.is_active = TRUE",
    )
    .bind(hash_token(token))
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Unauthorized {
        message: "Invalid access token".to_string(),
        docs_hint: Some("Log in again with POST /v1/auth/login.".to_string()),
    })?;

    if expired(row.expires_at) {
        return Err(AppError::Unauthorized {
            message: "Access token has expired".to_string(),
            docs_hint: Some("Log in again with POST /v1/auth/login.".to_string()),
        });
    }

    let token_id = row.credential_id;
    row.into_user(AuthMethod::AccessToken { token_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    fn user(role: Role, team_id: Option<Uuid>) -> AuthenticatedUser {
        AuthenticatedUser {
            profile_id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            role,
            team_id,
            auth_method: AuthMethod::AccessToken {
                token_id: Uuid::now_v7(),
            },
        }
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer eng_at_abc"));
        assert_eq!(bearer_token(&headers), Some("eng_at_abc"));
        headers.insert("authorization", HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(bearer_token(&headers), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn agents_cannot_manage_campaigns() {
        let agent = user(Role::Agent, None);
        assert!(agent.require(Permission::ReplyConversations, "reply").is_ok());
        let err = agent
            .require(Permission::ManageCampaigns, "POST /v1/campaigns")
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden { .. }));
    }

    #[test]
    fn scope_follows_role_and_team() {
        let team = Uuid::now_v7();
        assert_eq!(
            user(Role::TeamLeader, Some(team)).conversation_scope(),
            ConversationScope::Team(team)
        );
        let lead = user(Role::TeamLeader, None);
        assert_eq!(lead.conversation_scope(), ConversationScope::Own(lead.profile_id));
        assert_eq!(user(Role::Admin, None).conversation_scope(), ConversationScope::All);
    }

    #[test]
    fn expiry_check() {
        assert!(!expired(None));
        assert!(expired(Some(Utc::now() - chrono::Duration::seconds(1))));
        assert!(!expired(Some(Utc::now() + chrono::Duration::hours(1))));
    }
}
