use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

/// Build a CORS layer from a comma-separated origin list
/// (`ENGAGE_CORS_ORIGINS`, default `http://localhost:5173` for the dashboard dev server).
pub fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    let origins: Vec<HeaderValue> = parse_origins(origins.unwrap_or("http://localhost:5173"))
        .into_iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600))
}

fn parse_origins(raw: &str) -> Vec<String> {
    let mut origins: Vec<String> = Vec::new();
    for origin in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let origin = origin.trim_end_matches('/');
        if !origins.iter().any(|o| o.eq_ignore_ascii_case(origin)) {
            origins.push(origin.to_string());
        }
    }
    origins
}

#[cfg(test)]
mod tests {
    use super::parse_origins;

    #[test]
    fn origins_are_trimmed_and_deduplicated() {
        assert_eq!(
            parse_origins(" https://app.example.com/, https://APP.example.com ,,http://localhost:5173"),
            vec!["https://app.example.com", "http://localhost:5173"]
        );
        assert!(parse_origins(" , ").is_empty());
    }
}
