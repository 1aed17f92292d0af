use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use engage_core::webhook::{
    SIGNATURE_HEADER, WebhookPayload, payload_digest, verify_signature, verify_subscription,
};

use crate::error::AppError;
use crate::extract::AppQuery;
use crate::ingest;
use crate::state::AppState;

#[derive(Deserialize, utoipa::IntoParams)]
pub struct SubscriptionParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WebhookAck {
    /// `processed`, `duplicate` or `failed` (kept for replay)
    pub status: String,
}

/// Gateway deliveries carry their own per-IP rate limit.
pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/whatsapp", get(verify).post(receive))
}

/// Subscription handshake: echo `hub.challenge` when the verify token matches
#[utoipa::path(
    get,
    path = "/webhooks/whatsapp",
    params(SubscriptionParams),
    responses(
        (status = 200, description = "Challenge echoed", body = String),
        (status = 403, description = "Verify token mismatch", body = engage_core::error::ApiError)
    ),
    tag = "webhooks"
)]
pub async fn verify(
    State(state): State<AppState>,
    AppQuery(params): AppQuery<SubscriptionParams>,
) -> Result<String, AppError> {
    if !verify_subscription(
        params.mode.as_deref(),
        params.verify_token.as_deref(),
        &state.config.whatsapp.verify_token,
    ) {
        tracing::warn!(mode = ?params.mode, "webhook subscription rejected");
        return Err(AppError::forbidden("Verify token mismatch"));
    }
    tracing::info!("webhook subscription verified");
    Ok(params.challenge.unwrap_or_default())
}

/// Receive delivery statuses, inbound messages and template updates
///
/// The body is authenticated with `X-Hub-Signature-256`. Once authenticated
/// the delivery is always acknowledged with 200; processing failures are kept
/// on the stored event for replay.
#[utoipa::path(
    post,
    path = "/webhooks/whatsapp",
    request_body(content = String, description = "Raw gateway notification", content_type = "application/json"),
    responses(
        (status = 200, description = "Delivery acknowledged, including bodies that could not be parsed", body = WebhookAck),
        (status = 401, description = "Missing or invalid signature", body = engage_core::error::ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let secret = &state.config.whatsapp.app_secret;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if secret.is_empty() || !verify_signature(secret, &body, signature) {
        tracing::warn!(has_signature = signature.is_some(), "webhook signature rejected");
        return Err(AppError::Unauthorized {
            message: "Invalid webhook signature".to_string(),
            docs_hint: Some(format!(
                "Sign the raw body with the app secret and send it as '{SIGNATURE_HEADER}: sha256=<hex>'."
            )),
        });
    }

    let (raw, parsed) = parse_delivery(&body);
    let Some(event_id) = ingest::record_event(&state.db, &payload_digest(&body), &raw).await? else {
        tracing::debug!("duplicate webhook delivery acknowledged");
        return Ok(Json(WebhookAck {
            status: "duplicate".to_string(),
        }));
    };

    let payload = match parsed {
        Ok(payload) => payload,
        Err(reason) => {
            tracing::warn!(event_id = %event_id, error = %reason, "signed webhook could not be parsed");
            ingest::mark_failed(&state.db, event_id, &reason).await?;
            return Ok(Json(WebhookAck {
                status: "failed".to_string(),
            }));
        }
    };

    let status = match ingest::process_event(
        &state.db,
        event_id,
        &payload,
        state.config.completion_grace(),
    )
    .await
    {
        Ok(_) => "processed",
        Err(_) => "failed",
    };
    Ok(Json(WebhookAck {
        status: status.to_string(),
    }))
}

/// Split an authenticated body into what the inbox stores and what ingest
/// processes. A body that is not JSON is stored as a string.
fn parse_delivery(body: &[u8]) -> (serde_json::Value, Result<WebhookPayload, String>) {
    let raw: serde_json::Value = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(e) => {
            return (
                serde_json::Value::String(String::from_utf8_lossy(body).into_owned()),
                Err(format!("webhook body is not JSON: {e}")),
            );
        }
    };
    let payload = serde_json::from_value(raw.clone())
        .map_err(|e| format!("unexpected webhook shape: {e}"));
    (raw, payload)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use engage_core::webhook::sign;

    use crate::state::test_state;

    fn app() -> axum::Router {
        super::router().with_state(test_state())
    }

    #[tokio::test]
    async fn handshake_echoes_challenge() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=test-verify-token&hub.challenge=1158201444")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"1158201444");
    }

    #[tokio::test]
    async fn handshake_with_wrong_token_is_forbidden() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unsigned_delivery_is_unauthorized() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/whatsapp")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"object":"whatsapp_business_account","entry":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signature_over_different_body_is_unauthorized() {
        let signature = sign("test-app-secret", br#"{"object":"whatsapp_business_account","entry":[]}"#);
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/whatsapp")
                    .header("content-type", "application/json")
                    .header("x-hub-signature-256", signature)
                    .body(Body::from(r#"{"object":"whatsapp_business_account","entry":[{}]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn body_that_is_not_json_is_kept_as_text() {
        let (raw, parsed) = super::parse_delivery(b"not json");
        assert_eq!(raw, serde_json::Value::String("not json".to_string()));
        assert!(parsed.unwrap_err().contains("not JSON"));
    }

    #[test]
    fn status_without_a_status_field_is_kept_as_json() {
        let body = br#"{"entry":[{"changes":[{"field":"messages","value":{"statuses":[{"id":"wamid.X"}]}}]}]}"#;
        let (raw, parsed) = super::parse_delivery(body);
        assert_eq!(raw["entry"][0]["changes"][0]["value"]["statuses"][0]["id"], "wamid.X");
        assert!(parsed.unwrap_err().contains("unexpected webhook shape"));
    }

    #[tokio::test]
    async fn signed_garbage_is_acknowledged_and_stored_for_replay() {
        let Some(pool) = crate::db::testing::db_pool_if_available().await else {
            return;
        };
        let app = super::router().with_state(crate::state::AppState {
            db: pool.clone(),
            ..test_state()
        });
        let body = format!("not json {}", uuid::Uuid::now_v7());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/whatsapp")
                    .header("x-hub-signature-256", sign("test-app-secret", body.as_bytes()))
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let ack: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack["status"], "failed");

        let (error, processed): (Option<String>, bool) = sqlx::query_as(
            "SELECT error, processed_at IS NOT NULL FROM webhook_events WHERE payload_hash = $1",
        )
        .bind(engage_core::webhook::payload_digest(body.as_bytes()))
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(error.is_some_and(|e| e.contains("not JSON")));
        assert!(!processed);
    }
}
