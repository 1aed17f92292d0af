use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};

use crate::HealthResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Liveness and readiness of this instance
///
/// Reports `degraded` with 503 while Postgres is unreachable.
/// `workers_enabled` tells whether this instance runs the campaign
/// dispatcher and the window sweeper; API-only replicas report `false`, so
/// at least one instance behind the load balancer should report `true`.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Database reachable", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();
    if !db_ok {
        tracing::warn!("health check: database unreachable");
    }
    let (http_status, status) = readiness(db_ok);

    (
        http_status,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            workers_enabled: state.config.workers_enabled,
        }),
    )
}

fn readiness(db_ok: bool) -> (StatusCode, &'static str) {
    if db_ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::state::test_state;

    #[test]
    fn unreachable_database_is_degraded() {
        assert_eq!(readiness(true), (StatusCode::OK, "ok"));
        assert_eq!(readiness(false), (StatusCode::SERVICE_UNAVAILABLE, "degraded"));
    }

    #[tokio::test]
    async fn reports_worker_flag() {
        let Some(pool) = crate::db::testing::db_pool_if_available().await else {
            return;
        };
        let app = router().with_state(AppState {
            db: pool,
            ..test_state()
        });
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["workers_enabled"], false);
    }
}
