use axum::{
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::handlers::{self, AppState};
use super::ws::ws_handler;

/// Create the main router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Live stats cache
        .route("/stats", get(handlers::get_stats))
        .route("/models", get(handlers::get_models))
        .route("/models/top", get(handlers::get_top_models))
        .route("/models/daily-average", get(handlers::get_model_daily_average))
        .route("/daily", get(handlers::get_daily))
        .route("/trends", get(handlers::get_trends))
        .route("/summary", get(handlers::get_summary))
        .route("/cache-hit-rate", get(handlers::get_cache_hit_rate))
        .route("/history", get(handlers::get_history))
        // Cost routes
        .route("/cost", get(handlers::get_cost_summary))
        .route("/cost/daily", get(handlers::get_daily_cost))
        // Snapshot routes
        .route(
            "/snapshots",
            get(handlers::list_snapshots).post(handlers::create_snapshot),
        )
        .route("/snapshots/:id", get(handlers::get_snapshot))
        // Live subscribers
        .route("/connections", get(handlers::list_connections))
        // Health check
        .route("/health", get(handlers::health_check));

    // CORS layer for the dashboard dev server
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Combine routes
    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}
