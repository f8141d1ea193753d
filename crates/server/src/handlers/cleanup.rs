//! Cleanup policy administration and manual runs.

use super::common::{actor, read_json, rfc3339, rfc3339_opt};
use crate::auth::authorize;
use crate::cleanup::{RunOutcome, RunTrigger, run_guarded};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::cleanup::{
    DEFAULT_CADENCE_DAYS, DEFAULT_KEEP_DAYS, next_run_after, validate_settings,
};
use vreg_core::{Capability, CleanupStatus};
use vreg_metadata::models::CleanupPolicyRow;

#[derive(Debug, Deserialize)]
pub struct PutCleanupPolicyRequest {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cadence")]
    pub cadence_days: i32,
    #[serde(default = "default_keep")]
    pub keep_n_days_after_download: i32,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default = "default_true")]
    pub notify_on_failure: bool,
}

fn default_true() -> bool {
    true
}

fn default_cadence() -> i32 {
    DEFAULT_CADENCE_DAYS
}

fn default_keep() -> i32 {
    DEFAULT_KEEP_DAYS
}

#[derive(Debug, Serialize)]
pub struct CleanupPolicyResponse {
    pub group_id: String,
    pub enabled: bool,
    pub cadence_days: i32,
    pub keep_n_days_after_download: i32,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub status: String,
    pub next_run_at: Option<String>,
    pub last_run_started_at: Option<String>,
    pub last_run_at: Option<String>,
    pub last_run_deleted_size: i64,
    pub last_run_deleted_entries_count: i64,
    pub failure_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<CleanupPolicyRow> for CleanupPolicyResponse {
    fn from(row: CleanupPolicyRow) -> Self {
        Self {
            group_id: row.group_id.to_string(),
            enabled: row.enabled,
            cadence_days: row.cadence_days,
            keep_n_days_after_download: row.keep_n_days_after_download,
            notify_on_success: row.notify_on_success,
            notify_on_failure: row.notify_on_failure,
            status: row.status,
            next_run_at: rfc3339_opt(row.next_run_at),
            last_run_started_at: rfc3339_opt(row.last_run_started_at),
            last_run_at: rfc3339_opt(row.last_run_at),
            last_run_deleted_size: row.last_run_deleted_size,
            last_run_deleted_entries_count: row.last_run_deleted_entries_count,
            failure_message: row.failure_message,
            created_at: rfc3339(row.created_at),
            updated_at: rfc3339(row.updated_at),
        }
    }
}

fn policy_not_found(group_id: Uuid) -> ApiError {
    ApiError::NotFound(format!("no cleanup policy for group {group_id}"))
}

/// GET /v1/groups/{group_id}/cleanup_policy
pub async fn get_cleanup_policy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<CleanupPolicyResponse>> {
    authorize(&state, &actor(&req), Capability::ManageCleanup, group_id)?;
    let policy = state
        .metadata
        .get_cleanup_policy(group_id)
        .await?
        .ok_or_else(|| policy_not_found(group_id))?;
    Ok(Json(policy.into()))
}

/// PUT /v1/groups/{group_id}/cleanup_policy
///
/// Creates or replaces the policy settings. Run state is kept.
pub async fn put_cleanup_policy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<CleanupPolicyResponse>> {
    let actor = actor(&req);
    authorize(&state, &actor, Capability::ManageCleanup, group_id)?;
    let body: PutCleanupPolicyRequest = read_json(&state, req).await?;
    validate_settings(body.cadence_days, body.keep_n_days_after_download)?;

    let now = OffsetDateTime::now_utc();
    let row = CleanupPolicyRow {
        group_id,
        enabled: body.enabled,
        cadence_days: body.cadence_days,
        keep_n_days_after_download: body.keep_n_days_after_download,
        notify_on_success: body.notify_on_success,
        notify_on_failure: body.notify_on_failure,
        status: CleanupStatus::Idle.as_str().to_string(),
        next_run_at: Some(next_run_after(now, body.cadence_days)),
        last_run_started_at: None,
        last_run_at: None,
        last_run_deleted_size: 0,
        last_run_deleted_entries_count: 0,
        failure_message: None,
        created_at: now,
        updated_at: now,
    };
    let stored = state.metadata.upsert_cleanup_policy(&row).await?;

    tracing::info!(
        group_id = %group_id,
        enabled = stored.enabled,
        cadence_days = stored.cadence_days,
        keep_days = stored.keep_n_days_after_download,
        actor = actor.display_name(),
        "cleanup policy saved"
    );
    Ok(Json(stored.into()))
}

/// DELETE /v1/groups/{group_id}/cleanup_policy
pub async fn delete_cleanup_policy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<StatusCode> {
    let actor = actor(&req);
    authorize(&state, &actor, Capability::ManageCleanup, group_id)?;
    if !state.metadata.delete_cleanup_policy(group_id).await? {
        return Err(policy_not_found(group_id));
    }
    tracing::info!(group_id = %group_id, actor = actor.display_name(), "cleanup policy deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/groups/{group_id}/cleanup_policy/run
///
/// Runs cleanup now and waits for it. A run already in progress answers 409.
pub async fn run_cleanup(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<RunOutcome>> {
    let actor = actor(&req);
    authorize(&state, &actor, Capability::ManageCleanup, group_id)?;
    let policy = state
        .metadata
        .get_cleanup_policy(group_id)
        .await?
        .ok_or_else(|| policy_not_found(group_id))?;
    if !policy.enabled {
        return Err(ApiError::Conflict("cleanup policy is disabled".to_string()));
    }

    tracing::info!(group_id = %group_id, actor = actor.display_name(), "manual cleanup requested");
    match run_guarded(state.cleanup.clone(), group_id, RunTrigger::Manual).await? {
        RunOutcome::Skipped => Err(ApiError::Conflict(
            "a cleanup run is already in progress".to_string(),
        )),
        outcome => Ok(Json(outcome)),
    }
}
