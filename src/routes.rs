use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{handlers, security::middleware::internal_auth_middleware, state::AppState};

/// Request bodies above this are rejected before parsing.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let internal = Router::new()
        .route("/internal/sync-action", post(handlers::sync_action))
        .layer(middleware::from_fn_with_state(state.clone(), internal_auth_middleware));

    Router::new()
        .route("/check", post(handlers::check_message))
        .route("/config/:community_id", get(handlers::get_config).put(handlers::put_config))
        .route(
            "/blocked-words/:community_id",
            post(handlers::add_blocked_words).delete(handlers::remove_blocked_words),
        )
        .route(
            "/warnings/:community_id",
            get(handlers::list_warnings).post(handlers::issue_warning),
        )
        .route("/warnings/:community_id/status", get(handlers::warning_status))
        .route("/warnings/:community_id/:warning_id", delete(handlers::revoke_warning))
        .route("/filter-matches/:community_id", get(handlers::list_filter_matches))
        .route("/moderation-log/:community_id", get(handlers::moderation_log))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .merge(internal)
        .fallback(handlers::not_found)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
