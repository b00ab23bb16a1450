use axum::{
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::authz::executor::ScopedExecutor;
use crate::config::SecurityConfig;
use crate::handlers;
use crate::middleware::{jwt_auth_middleware, readiness_middleware, Readiness};

/// Shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub executor: ScopedExecutor,
    pub readiness: Readiness,
}

impl AppState {
    pub fn new(executor: ScopedExecutor, readiness: Readiness) -> Self {
        Self { executor, readiness }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Public
        .route("/health", get(handlers::health::health))
        // Protected
        .merge(scoped_routes(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&crate::config::config().security)),
        )
        .with_state(state)
}

fn scoped_routes(state: AppState) -> Router<AppState> {
    use handlers::{context, organizations};

    Router::new()
        .route("/api/authz/context", get(context::current_context))
        .route("/api/orgs", post(organizations::create))
        .route("/api/orgs/visible", get(organizations::visible))
        .route("/api/orgs/:id/ancestors", get(organizations::ancestors))
        .route("/api/orgs/:id/descendants", get(organizations::descendants))
        .route("/api/orgs/:id/parent", put(organizations::move_parent))
        // route_layer: the last layer added runs first
        .route_layer(from_fn(jwt_auth_middleware))
        .route_layer(from_fn_with_state(state.readiness, readiness_middleware))
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    if !security.enable_cors {
        return CorsLayer::new();
    }
    if security.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = security
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(origins)
}
