use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod analytics;
mod auth;
mod config;
mod db;
mod error;
mod extract;
mod gateway;
mod ingest;
mod middleware;
mod routes;
mod sender;
mod state;
mod sweeper;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Engage CRM API",
        version = "0.1.0",
        description = "Multi-tenant WhatsApp CRM: contacts, templates, broadcast campaigns and the shared inbox."
    ),
    paths(
        routes::health::health_check,
        routes::auth::login,
        routes::auth::logout,
        routes::auth::me,
        routes::profiles::list_profiles,
        routes::profiles::create_profile,
        routes::profiles::update_profile,
        routes::teams::list_teams,
        routes::teams::create_team,
        routes::teams::rename_team,
        routes::teams::delete_team,
        routes::teams::add_member,
        routes::teams::remove_member,
        routes::contacts::list_contacts,
        routes::contacts::create_contact,
        routes::contacts::batch_upsert_contacts,
        routes::contacts::get_contact,
        routes::contacts::update_contact,
        routes::contacts::delete_contact,
        routes::templates::list_templates,
        routes::templates::create_template,
        routes::templates::get_template,
        routes::templates::update_template,
        routes::templates::delete_template,
        routes::templates::preview_template,
        routes::campaigns::list_campaigns,
        routes::campaigns::create_campaign,
        routes::campaigns::get_campaign,
        routes::campaigns::update_campaign,
        routes::campaigns::delete_campaign,
        routes::campaigns::schedule_campaign,
        routes::campaigns::start_campaign,
        routes::campaigns::cancel_campaign,
        routes::campaigns::list_recipients,
        routes::campaigns::get_campaign_analytics,
        routes::conversations::list_conversations,
        routes::conversations::get_conversation,
        routes::conversations::list_messages,
        routes::conversations::send_message,
        routes::conversations::assign_conversation,
        routes::conversations::close_conversation,
        routes::webhooks::verify,
        routes::webhooks::receive,
        routes::admin::list_webhook_events,
        routes::admin::replay_webhook_event,
    ),
    components(schemas(
        HealthResponse,
        engage_core::error::ApiError,
        engage_core::roles::Role,
        engage_core::campaigns::CampaignStatus,
        engage_core::delivery::RecipientStatus,
        engage_core::templates::TemplateCategory,
        engage_core::templates::TemplateStatus,
        engage_core::window::ConversationStatus,
        engage_core::analytics::StatusCounts,
        engage_core::analytics::CampaignStats,
        engage_core::pagination::PaginatedResponse<routes::contacts::ContactResponse>,
        engage_core::pagination::PaginatedResponse<routes::campaigns::CampaignResponse>,
        engage_core::pagination::PaginatedResponse<routes::campaigns::RecipientResponse>,
        engage_core::pagination::PaginatedResponse<routes::conversations::ConversationResponse>,
        engage_core::pagination::PaginatedResponse<routes::conversations::MessageResponse>,
        analytics::CampaignAnalyticsResponse,
        routes::auth::LoginRequest,
        routes::auth::LoginResponse,
        routes::auth::MeResponse,
        routes::auth::LogoutResponse,
        routes::profiles::ProfileResponse,
        routes::profiles::CreateProfileRequest,
        routes::profiles::UpdateProfileRequest,
        routes::teams::TeamResponse,
        routes::teams::TeamRequest,
        routes::teams::TeamMembershipResponse,
        routes::contacts::ContactResponse,
        routes::contacts::CreateContactRequest,
        routes::contacts::UpdateContactRequest,
        routes::contacts::BatchContactsRequest,
        routes::contacts::BatchContactError,
        routes::contacts::BatchContactsResponse,
        routes::templates::TemplateResponse,
        routes::templates::CreateTemplateRequest,
        routes::templates::UpdateTemplateRequest,
        routes::templates::PreviewTemplateRequest,
        routes::templates::PreviewTemplateResponse,
        routes::campaigns::CampaignResponse,
        routes::campaigns::CreateCampaignRequest,
        routes::campaigns::UpdateCampaignRequest,
        routes::campaigns::ScheduleCampaignRequest,
        routes::campaigns::RecipientResponse,
        routes::conversations::WindowInfo,
        routes::conversations::ConversationResponse,
        routes::conversations::MessageResponse,
        routes::conversations::SendMessageRequest,
        routes::conversations::AssignConversationRequest,
        routes::webhooks::WebhookAck,
        routes::admin::WebhookEventSummary,
        routes::admin::ReplayResponse,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub workers_enabled: bool,
}

/// All routes with their rate limits, authentication injection and the
/// outer HTTP layers.
pub fn build_router(app_state: state::AppState) -> Router {
    let require_https = app_state.config.require_https;
    let cors_layer = middleware::cors::build_cors_layer(app_state.config.cors_origins.as_deref());

    let api = Router::new()
        .merge(routes::auth::router())
        .merge(routes::profiles::router())
        .merge(routes::teams::router())
        .merge(routes::contacts::router())
        .merge(routes::templates::router())
        .merge(routes::campaigns::router())
        .merge(routes::conversations::router())
        .merge(routes::admin::router())
        .layer(middleware::rate_limit::api_layer());

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::auth::login_router().layer(middleware::rate_limit::login_layer()))
        .merge(routes::webhooks::router().layer(middleware::rate_limit::webhook_layer()))
        .merge(api)
        .layer(auth::InjectAuthLayer::new(app_state.db.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .option_layer(require_https.then(|| {
                    axum::middleware::from_fn(middleware::https::require_https)
                }))
                .layer(cors_layer)
                .layer(axum::middleware::from_fn(middleware::security_headers::apply)),
        )
        .with_state(app_state)
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engage_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = match config::AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            eprintln!("engage-api: {e}");
            std::process::exit(2);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let gateway = gateway::WhatsAppCloudClient::new(&config.whatsapp)
        .expect("Failed to build WhatsApp HTTP client");
    if config.whatsapp.app_secret.is_empty() {
        tracing::warn!("WHATSAPP_APP_SECRET is empty; webhook deliveries will be rejected");
    }

    let app_state = state::AppState {
        db: pool,
        send_limiter: state::send_limiter(config.send_rate_per_sec),
        gateway: Arc::new(gateway),
        config: Arc::new(config),
    };

    if app_state.config.workers_enabled {
        sender::spawn(app_state.clone());
        sweeper::spawn(app_state.clone());
    } else {
        tracing::info!("background workers disabled");
    }

    let port = app_state.config.port;
    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Engage API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use utoipa::OpenApi;

    use super::{ApiDoc, build_router};
    use crate::state::test_state;

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.7")
    }

    #[tokio::test]
    async fn unauthenticated_api_calls_are_rejected() {
        let app = build_router(test_state());
        for uri in ["/v1/auth/me", "/v1/campaigns", "/v1/conversations", "/v1/contacts"] {
            let response = app
                .clone()
                .oneshot(request("GET", uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(
                response.headers().get("x-content-type-options").unwrap(),
                "nosniff"
            );
        }
    }

    #[tokio::test]
    async fn webhook_routes_are_mounted() {
        let app = build_router(test_state());
        let response = app
            .clone()
            .oneshot(
                request(
                    "GET",
                    "/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=test-verify-token&hub.challenge=42",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                request("POST", "/webhooks/whatsapp")
                    .header("x-hub-signature-256", "sha256=00")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let response = build_router(test_state())
            .oneshot(request("GET", "/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn openapi_documents_every_resource() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/v1/auth/login",
            "/v1/campaigns/{id}/start",
            "/v1/conversations/{id}/messages",
            "/webhooks/whatsapp",
            "/v1/admin/webhooks/{event_id}/replay",
        ] {
            assert!(doc.paths.paths.contains_key(path), "{path} missing");
        }
        let schemes = doc.components.unwrap().security_schemes;
        assert!(schemes.contains_key("bearer_auth"));
    }
}
