use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response returned by every endpoint.
/// Carries enough context for a dashboard or operator to act on the failure.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "not_found", "window_expired")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INVALID_TRANSITION: &str = "invalid_transition";
    pub const WINDOW_EXPIRED: &str = "window_expired";
    pub const NO_INBOUND_MESSAGE: &str = "no_inbound_message";
    pub const CONVERSATION_CLOSED: &str = "conversation_closed";
    pub const GATEWAY_ERROR: &str = "gateway_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const RATE_LIMITED: &str = "rate_limited";
}

/// Domain rule violations raised by the pure logic in this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("{field}: {message}")]
    Invalid { field: String, message: String },

    #[error("cannot {action} a campaign in status '{from}'")]
    InvalidTransition { from: String, action: String },
}

impl CoreError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
