//! Sync API endpoints
//!
//! One exchange endpoint, the destructive reset, and a bookkeeping status view.
//! Every call requires a resolved caller identity before the coordinator runs.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use crate::auth::AuthedOwner;
use crate::error::Result;
use crate::state::AppState;
use crate::sync::{
    ResetResponse, SyncCoordinator, SyncRequest, SyncResponse, SyncStatusResponse,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(synchronize))
        .route("/reset", post(reset))
        .route("/status", get(status))
}

/// Run one sync exchange for the authenticated owner
async fn synchronize(
    State(state): State<AppState>,
    AuthedOwner(owner_id): AuthedOwner,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>> {
    let coordinator = SyncCoordinator::new(state.db());
    let outcome = coordinator
        .synchronize(&owner_id, request.last_sync, &request.changes)
        .await?;

    Ok(Json(SyncResponse {
        success: true,
        timestamp: outcome.timestamp,
        changes: outcome.changes,
        failed_types: outcome.failed_types,
    }))
}

/// Destructive reset of all synced data for the authenticated owner
async fn reset(
    State(state): State<AppState>,
    AuthedOwner(owner_id): AuthedOwner,
) -> Result<Json<ResetResponse>> {
    let coordinator = SyncCoordinator::new(state.db());
    coordinator.reset_all(&owner_id).await?;

    Ok(Json(ResetResponse { success: true }))
}

/// Bookkeeping watermark and live record counts
async fn status(
    State(state): State<AppState>,
    AuthedOwner(owner_id): AuthedOwner,
) -> Result<Json<SyncStatusResponse>> {
    let coordinator = SyncCoordinator::new(state.db());
    let status = coordinator.status(&owner_id).await?;

    Ok(Json(status))
}
