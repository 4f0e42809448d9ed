//! # topostore HTTP API Module
//!
//! REST access to the live graph, point-in-time reads, revision history and
//! inbound replication.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /status` - Entity counts, cache mode, origin
//! - `GET /mode`, `PUT /mode` - Read or switch the cache mode
//! - `POST /messages` - Apply a replication envelope
//! - `GET /nodes`, `GET /nodes/{id}`, `GET /nodes/{id}/edges` - Node reads
//! - `GET /nodes/{id}/history` - Every revision of a node
//! - `GET /edges`, `GET /edges/{id}` - Edge reads
//! - `GET /edges/{id}/history` - Every revision of an edge
//!
//! Read endpoints accept `at`, `from`, `to` (ms) and `filter` (JSON object).
//!
//! ## Security
//!
//! Allowed CORS origins and the rate limit come from
//! [`crate::config::ServerSection`]. `TOPOSTORE_API_KEY`, when set, requires
//! Bearer token authentication.

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::get_api_key_from_env;
pub use handlers::{ApiError, status_for};
pub use middleware::create_rate_limiter;
pub use types::{
    ErrorResponse, HealthResponse, MessageResponse, ModeRequest, ModeResponse, ReadQuery,
    StatusResponse,
};

use crate::config::{ANY_ORIGIN, ServerSection};
use crate::topology::Topology;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use std::time::Duration;
use topostore_core::TopologyError;
use topostore_core::primitives::MAX_ENVELOPE_BYTES;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub topology: Topology,
    /// Deadline for each core call.
    pub request_timeout: Duration,
    /// Requests per second; `0` disables limiting.
    pub rate_limit: u32,
    /// Browser origins admitted by the CORS layer.
    pub cors_origins: Vec<String>,
}

impl AppState {
    #[must_use]
    pub fn new(topology: Topology, server: &ServerSection) -> Self {
        Self {
            topology,
            request_timeout: server.request_timeout(),
            rate_limit: server.rate_limit,
            cors_origins: server.cors_origins.clone(),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Cross-origin policy for `origins` as validated by
/// [`ServerSection::validate`]. `*` anywhere in the list admits every origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|origin| origin == ANY_ORIGIN) {
        tracing::warn!("CORS admits every origin; restrict server.cors_origins in production");
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "ignoring CORS origin");
                None
            }
        })
        .collect();
    tracing::info!(origins = ?origins, "CORS origins");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. CORS - handles preflight requests
/// 3. Rate Limiting - global quota (if enabled)
/// 4. Authentication - validates API key (if configured)
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);

    let rate_limiter = if state.rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", state.rate_limit);
        Some(create_rate_limiter(state.rate_limit))
    } else {
        tracing::info!("Rate limiting disabled");
        None
    };

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible. \
             Set TOPOSTORE_API_KEY to enable authentication."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route(
            "/mode",
            get(handlers::get_mode_handler).put(handlers::put_mode_handler),
        )
        .route("/messages", post(handlers::message_handler))
        .route("/nodes", get(handlers::nodes_handler))
        .route("/nodes/{id}", get(handlers::node_handler))
        .route("/nodes/{id}/edges", get(handlers::node_edges_handler))
        .route("/nodes/{id}/history", get(handlers::node_history_handler))
        .route("/edges", get(handlers::edges_handler))
        .route("/edges/{id}", get(handlers::edge_handler))
        .route("/edges/{id}/history", get(handlers::edge_history_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(axum::extract::DefaultBodyLimit::max(MAX_ENVELOPE_BYTES)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve `topology` until Ctrl+C.
pub async fn run_server(topology: Topology, server: &ServerSection) -> Result<(), TopologyError> {
    let addr = server.addr();
    let router = create_router(AppState::new(topology, server));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TopologyError::Io(format!("Bind failed: {}", e)))?;

    tracing::info!("topostore HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| TopologyError::Io(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
