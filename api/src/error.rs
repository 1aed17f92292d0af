use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use engage_core::error::{self, ApiError, CoreError};
use engage_core::window::BlockReason;

use crate::gateway::GatewayError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or invalid credentials (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Authenticated but not allowed (403)
    Forbidden {
        message: String,
        docs_hint: Option<String>,
    },
    /// Resource does not exist in the caller's organization (404)
    NotFound { resource: String },
    /// Unique constraint or state conflict (409)
    Conflict { message: String },
    /// Campaign lifecycle violation (409)
    InvalidTransition { message: String },
    /// Free-form send outside the customer window (409)
    WindowClosed(BlockReason),
    /// Too many requests (429)
    RateLimited { retry_after_secs: Option<u64> },
    /// Messaging gateway refused or failed (502)
    Gateway(GatewayError),
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.into()),
            received: None,
            docs_hint: None,
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        AppError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        AppError::Forbidden {
            message: message.into(),
            docs_hint: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::Conflict {
            message: message.into(),
        }
    }
}

fn body(code: &str, message: String, request_id: String) -> ApiError {
    ApiError {
        error: code.to_string(),
        message,
        field: None,
        received: None,
        request_id,
        docs_hint: None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();
        let mut retry_after = None;

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    docs_hint,
                    ..body(error::codes::UNAUTHORIZED, message, request_id)
                },
            ),
            AppError::Forbidden { message, docs_hint } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    docs_hint,
                    ..body(error::codes::FORBIDDEN, message, request_id)
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                body(
                    error::codes::NOT_FOUND,
                    format!("{resource} not found"),
                    request_id,
                ),
            ),
            AppError::Conflict { message } => (
                StatusCode::CONFLICT,
                body(error::codes::CONFLICT, message, request_id),
            ),
            AppError::InvalidTransition { message } => (
                StatusCode::CONFLICT,
                body(error::codes::INVALID_TRANSITION, message, request_id),
            ),
            AppError::WindowClosed(reason) => {
                let (code, message, hint) = match reason {
                    BlockReason::NoInboundMessage => (
                        error::codes::NO_INBOUND_MESSAGE,
                        "The customer has not written yet; free-form messages are not allowed"
                            .to_string(),
                        "Send an approved template instead.",
                    ),
                    BlockReason::WindowExpired { expired_at } => (
                        error::codes::WINDOW_EXPIRED,
                        format!(
                            "The 24h customer window expired at {}",
                            expired_at.to_rfc3339()
                        ),
                        "Send an approved template to re-engage the customer.",
                    ),
                    BlockReason::ConversationClosed => (
                        error::codes::CONVERSATION_CLOSED,
                        "The conversation is closed".to_string(),
                        "Conversations reopen when the customer writes again.",
                    ),
                };
                (
                    StatusCode::CONFLICT,
                    ApiError {
                        docs_hint: Some(hint.to_string()),
                        ..body(code, message, request_id)
                    },
                )
            }
            AppError::RateLimited { retry_after_secs } => {
                retry_after = retry_after_secs;
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    body(
                        error::codes::RATE_LIMITED,
                        "Too many requests".to_string(),
                        request_id,
                    ),
                )
            }
            AppError::Gateway(err) => {
                tracing::warn!(error = %err, "messaging gateway error");
                if err.is_window_expired() {
                    (
                        StatusCode::CONFLICT,
                        body(error::codes::WINDOW_EXPIRED, err.to_string(), request_id),
                    )
                } else {
                    (
                        StatusCode::BAD_GATEWAY,
                        body(error::codes::GATEWAY_ERROR, err.to_string(), request_id),
                    )
                }
            }
            AppError::Database(err) => {
                if let sqlx::Error::Database(ref db_err) = err {
                    if db_err.code().as_deref() == Some("23505") {
                        let constraint = db_err.constraint().unwrap_or("unique constraint");
                        return AppError::Conflict {
                            message: format!("Resource already exists ({constraint})"),
                        }
                        .into_response();
                    }
                }
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    body(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    body(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
        };

        let mut response = (status, Json(api_error)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Invalid { field, message } => AppError::Validation {
                message,
                field: Some(field),
                received: None,
                docs_hint: None,
            },
            err @ CoreError::InvalidTransition { .. } => AppError::InvalidTransition {
                message: err.to_string(),
            },
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::Gateway(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    async fn json_of(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn window_expired_is_a_conflict_with_code() {
        let expired_at = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        let response = AppError::WindowClosed(BlockReason::WindowExpired { expired_at }).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_of(response).await;
        assert_eq!(body["error"], "window_expired");
        assert!(body["request_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn no_inbound_message_has_its_own_code() {
        let response = AppError::WindowClosed(BlockReason::NoInboundMessage).into_response();
        assert_eq!(json_of(response).await["error"], "no_inbound_message");
    }

    #[tokio::test]
    async fn core_errors_map_to_validation_and_transition() {
        let response = AppError::from(CoreError::invalid("phone", "too short")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_of(response).await;
        assert_eq!(body["field"], "phone");

        let transition = engage_core::campaigns::CampaignStatus::Sent
            .transition(engage_core::campaigns::CampaignAction::Cancel)
            .unwrap_err();
        let response = AppError::from(transition).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_of(response).await["error"], "invalid_transition");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = AppError::RateLimited {
            retry_after_secs: Some(12),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "12");
    }

    #[tokio::test]
    async fn gateway_window_rejection_is_conflict() {
        let response = AppError::Gateway(GatewayError::Rejected {
            code: crate::gateway::WINDOW_EXPIRED_CODE,
            message: "re-engagement".to_string(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = AppError::Gateway(GatewayError::Unavailable("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
