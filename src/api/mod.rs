pub mod auth;
pub mod error;
mod handlers;
pub mod origin;
pub mod ratelimit;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use ratelimit::RateLimiter;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    /// Live WebSocket sessions.
    pub connections: Arc<AtomicUsize>,
    /// Cancelled on server shutdown; every session holds a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, limiter: Arc<RateLimiter>, shutdown: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            limiter,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let config = state.config.clone();
    let limiter = state.limiter.clone();

    let protected = Router::new()
        .route("/ws", get(ws))
        .with_state(state.clone());

    let protected = match &config.credential {
        Some(credential) => {
            let gate = Arc::new(auth::AuthGate::new(credential.clone(), limiter));
            protected.layer(axum::middleware::from_fn(move |req, next| {
                let g = gate.clone();
                async move { auth::require_basic_auth(g, req, next).await }
            }))
        }
        None => {
            // No credential: refuse upgrades initiated by foreign pages.
            let mut allowed_origins = origin::loopback_origins(config.bind.port());
            allowed_origins.extend(config.ws_origins.iter().cloned());
            protected.layer(axum::middleware::from_fn(move |req, next| {
                let origins = allowed_origins.clone();
                origin::check_ws_origin(origins, req, next)
            }))
        }
    };

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("server"),
            HeaderValue::from_static("webmux"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
}
