//! Read-only views of the coordinator and its log.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use futures_util::TryStreamExt;
use manager::state::{ExternalSnapshot, PendingSnapshot, ResourceSnapshot, TransactionSnapshot};
use serde::Serialize;
use transaction_log::LogEntry;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct ResourcesResponse {
    pub resources: Vec<ResourceSnapshot>,
    /// Remote domains currently taking part in a transaction.
    pub externals: Vec<ExternalSnapshot>,
}

/// GET /transactions: the coordinator's transaction table.
#[tracing::instrument(skip(state))]
pub async fn transactions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TransactionSnapshot>>, ApiError> {
    let snapshot = state.manager.snapshot().await?;
    Ok(Json(snapshot.transactions))
}

/// GET /resources: configured resources with per-instance state and
/// call statistics.
#[tracing::instrument(skip(state))]
pub async fn resources(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ResourcesResponse>, ApiError> {
    let snapshot = state.manager.snapshot().await?;
    Ok(Json(ResourcesResponse {
        resources: snapshot.resources,
        externals: snapshot.externals,
    }))
}

/// GET /pending: requests waiting for a busy instance.
#[tracing::instrument(skip(state))]
pub async fn pending(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PendingSnapshot>>, ApiError> {
    let snapshot = state.manager.snapshot().await?;
    Ok(Json(snapshot.pending))
}

/// GET /log: every entry still in the transaction log.
#[tracing::instrument(skip(state))]
pub async fn log(State(state): State<Arc<AppState>>) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let entries: Vec<LogEntry> = state.log.scan().await?.try_collect().await?;
    Ok(Json(entries))
}
