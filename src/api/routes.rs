//! Route definitions

use super::handlers::*;
use axum::{routing::get, Router};
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rounds/history", get(round_history_handler))
        .route("/rounds/:id/verify", get(verify_round_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
