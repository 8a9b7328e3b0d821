//! Request handlers

use super::{
    errors::ApiError,
    middleware::RequestId,
    models::*,
};
use crate::{
    chain::{verify_link, HashChainGenerator},
    errors::LedgerError,
    ledger::Ledger,
    metrics::MetricsSnapshot,
};
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use std::sync::Arc;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Shared application state
pub struct AppState {
    pub ledger: Ledger,
    pub chain: Arc<HashChainGenerator>,
    pub version: String,
}

async fn blocking<T, F>(request_id: &RequestId, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| ApiError::internal_error(&request_id.0, format!("task failed: {}", e)))?
}

/// GET /health
pub async fn health_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let ledger = state.ledger.clone();
    let rid = request_id.0.clone();
    let last_round = blocking(&request_id, move || {
        ledger.last_round().map_err(|e| ApiError::ledger(&rid, e))
    })
    .await?;

    Ok(Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
        last_round_id: last_round.map(|r| r.id),
    }))
}

/// GET /rounds/history?limit=N
pub async fn round_history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::bad_request(
            &request_id.0,
            format!("limit must be between 1 and {}", MAX_HISTORY_LIMIT),
        ));
    }

    let ledger = state.ledger.clone();
    let rid = request_id.0.clone();
    let rounds = blocking(&request_id, move || {
        ledger.round_history(limit).map_err(|e| ApiError::ledger(&rid, e))
    })
    .await?;

    Ok(Json(HistoryResponse { rounds }))
}

/// GET /rounds/:id/verify
///
/// Only ended rounds are served; disclosing the hash of a live round would
/// reveal its crash point.
pub async fn verify_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<u64>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let ledger = state.ledger.clone();
    let chain = state.chain.clone();
    let rid = request_id.0.clone();

    let response = blocking(&request_id, move || {
        let round = ledger
            .get_round(round_id)
            .map_err(|e| ApiError::ledger(&rid, e))?
            .filter(|r| r.ended)
            .ok_or_else(|| ApiError::not_found(&rid, format!("no ended round {}", round_id)))?;

        let segment = chain
            .segment_for(round_id)
            .map_err(|e| ApiError::internal_error(&rid, e.to_string()))?;
        let previous_hash = match segment {
            Some(segment) if segment.first_round_id == round_id => segment.commitment,
            Some(_) => ledger
                .store()
                .round_hash(round_id - 1)
                .map_err(|e| ApiError::ledger(&rid, LedgerError::from(e)))?,
            None => None,
        };

        let recomputed = ledger.resolver().crash_point(&round.hash);
        Ok(VerifyResponse {
            round_id,
            hash: round.hash,
            crash_point: round.crash_point,
            recomputed_crash_point: recomputed,
            crash_point_valid: recomputed == round.crash_point,
            previous_hash,
            link_valid: previous_hash.map(|previous| verify_link(&previous, &round.hash)),
        })
    })
    .await?;

    Ok(Json(response))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.ledger.metrics().snapshot())
}
