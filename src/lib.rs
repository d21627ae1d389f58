pub mod alerts;
pub mod api_keys;
pub mod config;
pub mod crypto;
pub mod health;
pub mod models;
pub mod pricing;
pub mod proxy;
pub mod selection;
pub mod state;
pub mod worker;
pub mod x402;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

// ---------------------------------------------------------------------------
// Request-ID middleware
// ---------------------------------------------------------------------------

/// Middleware that assigns a UUID correlation ID to every request.
/// - Adds the ID to the current tracing span for structured logging.
/// - Returns it as `X-Request-Id` response header for client-side correlation.
pub async fn request_id_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = uuid::Uuid::new_v4().to_string();

    tracing::Span::current().record("request_id", tracing::field::display(&request_id));
    tracing::debug!(request_id = %request_id, "assigned correlation ID");

    let mut response = next.run(request).await;

    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", val);
    }

    response
}

// ── OpenAPI documentation ────────────────────────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "LibertAI Gateway",
        version = "1.3.0",
        description = "Authenticating, load-balancing reverse proxy for inference backends",
    ),
    paths(
        models::health,
        models::models_list,
        models::openai_models_list,
        api_keys::check_auth,
        proxy::proxy_request,
    ),
    tags(
        (name = "health", description = "Gateway self-health"),
        (name = "models", description = "Model catalogue"),
        (name = "auth", description = "API key checks"),
        (name = "proxy", description = "Inference proxy entrypoint"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    // Anything-goes CORS: the gateway fronts public inference APIs.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(models::health))
        .route("/libertai/models", get(models::models_list))
        .route("/v1/models", get(models::openai_models_list))
        .route("/libertai/auth/check", get(api_keys::check_auth))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Everything else is a completion path proxied to a replica.
        .route("/{*path}", post(proxy::proxy_request))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}
