pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod ports;
pub mod validation;

use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::ReconciliationEngine;
use crate::gateway::GatewayAdapter;
use crate::middleware::ip_filter::CallbackIpFilterLayer;
use crate::ports::TransactionStore;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub store: Arc<dyn TransactionStore>,
    pub gateway: Arc<dyn GatewayAdapter>,
    pub config: Arc<Config>,
}

pub fn create_app(state: AppState) -> Router {
    // Only the callback route sits behind the source-IP filter; everything
    // else is reached through the storefront's own gateway.
    let callback_routes = Router::new()
        .route(
            "/callbacks/hosted-checkout",
            post(handlers::callback::hosted_checkout),
        )
        .layer(CallbackIpFilterLayer::new(
            state.config.allowed_callback_ips.clone(),
            state.config.trusted_proxy_depth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api-docs/openapi.json", get(handlers::openapi_json))
        .route("/payments", post(handlers::payments::create_payment))
        .route(
            "/payments/:transaction_id",
            get(handlers::payments::get_payment),
        )
        .route(
            "/payments/:transaction_id/refunds",
            post(handlers::payments::create_refund).get(handlers::payments::list_refunds),
        )
        .merge(callback_routes)
        .layer(cors_layer(&state.config))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
