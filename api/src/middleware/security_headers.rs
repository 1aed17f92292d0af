use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

/// Security-header baseline for every response. API responses under `/v1`
/// carry contact data and are additionally marked non-cacheable.
pub async fn apply(req: Request, next: Next) -> Response {
    let is_api = req.uri().path().starts_with("/v1/");
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("frame-ancestors 'none'"),
    );
    if is_api {
        headers.insert("cache-control", HeaderValue::from_static("no-store"));
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::{Router, middleware};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/v1/contacts", get(|| async { StatusCode::OK }))
            .layer(middleware::from_fn(super::apply))
    }

    async fn headers_for(uri: &str) -> axum::http::HeaderMap {
        app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .headers()
            .clone()
    }

    #[tokio::test]
    async fn baseline_headers_on_every_route() {
        let headers = headers_for("/health").await;
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            headers.get("content-security-policy").unwrap(),
            "frame-ancestors 'none'"
        );
        assert!(headers.get("cache-control").is_none());
    }

    #[tokio::test]
    async fn api_responses_are_not_cached() {
        let headers = headers_for("/v1/contacts").await;
        assert_eq!(headers.get("cache-control").unwrap(), "no-store");
    }
}
