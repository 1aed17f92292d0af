use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Enforce HTTPS behind a TLS-terminating proxy via `X-Forwarded-Proto`.
/// Plain-HTTP requests are redirected; every response carries HSTS.
/// Webhook deliveries are never redirected (the gateway does not follow them).
pub async fn require_https(req: Request, next: Next) -> Response {
    let proto = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");

    if proto == "http" && !req.uri().path().starts_with("/webhooks/") {
        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        if let Ok(uri) = format!("https://{host}{path_and_query}").parse::<Uri>() {
            let mut response =
                (StatusCode::PERMANENT_REDIRECT, [("location", uri.to_string())]).into_response();
            add_hsts_header(&mut response);
            return response;
        }
    }

    let mut response = next.run(req).await;
    add_hsts_header(&mut response);
    response
}

fn add_hsts_header(response: &mut Response) {
    response.headers_mut().insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::{get, post};
    use axum::{Router, middleware};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/v1/contacts", get(|| async { StatusCode::OK }))
            .route("/webhooks/whatsapp", post(|| async { StatusCode::OK }))
            .layer(middleware::from_fn(super::require_https))
    }

    #[tokio::test]
    async fn plain_http_is_redirected() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/v1/contacts?limit=5")
                    .header("x-forwarded-proto", "http")
                    .header("host", "api.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://api.example.com/v1/contacts?limit=5"
        );
    }

    #[tokio::test]
    async fn webhooks_pass_through_with_hsts() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/whatsapp")
                    .header("x-forwarded-proto", "http")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("strict-transport-security"));
    }
}
