//! Axum router configuration with middleware.
//!
//! The WebSocket transport lives at `/ws`; the read-only admin surface is
//! nested under `/admin/v1`. Middleware: CORS and request tracing.

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::GatewayState;

/// Build the complete gateway router with all routes and middleware.
pub fn build_router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin_routes = Router::new()
        .route(
            "/tenants/{tenant_id}/sessions",
            get(handlers::admin::list_sessions),
        )
        .route(
            "/tenants/{tenant_id}/rooms",
            get(handlers::admin::list_rooms),
        )
        .route(
            "/tenants/{tenant_id}/rooms/{room_id}/history",
            get(handlers::admin::room_history),
        )
        .route(
            "/tenants/{tenant_id}/rooms/{room_id}/presence",
            get(handlers::admin::room_presence),
        );

    Router::new()
        .nest("/admin/v1", admin_routes)
        .route("/ws", get(handlers::ws::ws_handler))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
