pub mod auth;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod websocket;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::config::Config;
use crate::handlers::{health_check, login_callback, prometheus_metrics, start_login};
use crate::registry::RegistryOptions;
use crate::websocket::{websocket_handler, SignalingState};

pub fn registry_options(config: &Config) -> RegistryOptions {
    RegistryOptions {
        code_ttl: config.pairing_code_ttl,
        debug_code: config.debug_pairing_code,
        auth_policy: config.auth_policy,
        login_path: format!("/auth/{}", config.provider_name()),
    }
}

pub fn build_state(config: &Config) -> SignalingState {
    SignalingState::new(registry_options(config), AuthService::from_config(config))
}

pub fn build_router(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/auth/:provider", get(start_login))
        .route("/auth/:provider/callback", get(login_callback))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until the listener fails. The sweeper runs for the server's lifetime.
pub async fn serve(listener: TcpListener, config: &Config) -> std::io::Result<()> {
    let state = build_state(config);
    let _sweeper = state.spawn_code_sweeper(config.code_sweep_interval);
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
