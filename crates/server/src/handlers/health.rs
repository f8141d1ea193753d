//! Health check.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage_backend: &'static str,
    /// Upstream fetches running on this instance.
    pub fetches_in_flight: usize,
}

/// GET /v1/health
///
/// Unauthenticated, for load balancer and orchestrator probes. Fails when
/// either the metadata store or the object store is unreachable.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;
    state.storage.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        storage_backend: state.storage.backend_name(),
        fetches_in_flight: state.orchestrator.in_flight(),
    }))
}
