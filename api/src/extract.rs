//! Extractors that turn axum rejections into structured `AppError` responses.
//!
//! `AppJson<T>` and `AppQuery<T>` replace `axum::Json<T>` / `axum::extract::Query<T>`
//! in handler signatures so malformed input yields a JSON `validation_failed`
//! body instead of axum's plain-text rejection.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::Json;

use crate::error::AppError;

const SCHEMA_HINT: &str = "Check the request against the endpoint's schema at /api-doc/openapi.json.";

pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_rejection_text(&rejection.body_text(), "body")),
        }
    }
}

pub struct AppQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(AppQuery(value)),
            Err(rejection) => Err(map_rejection_text(&rejection.body_text(), "query")),
        }
    }
}

/// Deserialize a PATCH field where `null` clears the value and an absent
/// field leaves it untouched. Use with `#[serde(default, deserialize_with = "nullable")]`.
pub fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de>,
{
    <Option<T> as serde::Deserialize>::deserialize(deserializer).map(Some)
}

fn map_rejection_text(text: &str, fallback_field: &str) -> AppError {
    AppError::Validation {
        message: format!("Invalid request {fallback_field}: {text}"),
        field: Some(field_from_serde_message(text).unwrap_or_else(|| fallback_field.to_string())),
        received: None,
        docs_hint: Some(SCHEMA_HINT.to_string()),
    }
}

/// Pull the offending field name out of serde's "missing field `x`" /
/// "unknown field `x`" messages.
fn field_from_serde_message(msg: &str) -> Option<String> {
    ["missing field `", "unknown field `"].iter().find_map(|pattern| {
        let start = msg.find(pattern)? + pattern.len();
        let after = &msg[start..];
        let end = after.find('`')?;
        Some(after[..end].to_string())
    })
}
