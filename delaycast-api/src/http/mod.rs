// Module: http
// Admin HTTP/JSON API over the relay registry

pub mod error;
pub mod health;
pub mod middleware;
pub mod relay;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, put},
    Router,
};
use delaycast_relay::RelayRegistry;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RelayRegistry>,
    /// Required bearer token for `/api` routes; `None` disables the check
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(registry: Arc<RelayRegistry>, admin_token: Option<String>) -> Self {
        Self {
            registry,
            admin_token: admin_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/rooms/{room}/participants/{participant}/delay",
            put(relay::set_delay).delete(relay::clear_delay),
        )
        .route(
            "/api/rooms/{room}/participants/{participant}/relay",
            get(relay::get_relay),
        )
        .route("/api/rooms/{room}/participants", get(relay::list_participants))
        .route("/api/rooms/{room}/delays", get(relay::get_delays))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_admin));

    Router::new()
        .merge(health::create_health_router())
        .merge(api)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
