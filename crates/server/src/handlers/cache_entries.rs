//! Cache entry listing and explicit invalidation.

use super::common::{actor, rfc3339, rfc3339_opt, upstream_for};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::Capability;
use vreg_core::registry::normalize_relative_path;
use vreg_metadata::models::CacheEntryRow;

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;

/// Query parameters for listing cache entries.
#[derive(Debug, Deserialize)]
pub struct ListEntriesParams {
    /// Page size (default: 100, max: 1000).
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteEntryParams {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct CacheEntryResponse {
    pub entry_id: String,
    pub upstream_id: String,
    pub relative_path: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub checksum_sha1: String,
    pub checksum_md5: Option<String>,
    pub checksum_sha256: String,
    pub integrity_verified: bool,
    pub needs_revalidation: bool,
    pub upstream_checked_at: String,
    pub download_count: i64,
    pub last_downloaded_at: Option<String>,
    pub created_at: String,
}

impl From<CacheEntryRow> for CacheEntryResponse {
    fn from(row: CacheEntryRow) -> Self {
        Self {
            entry_id: row.entry_id.to_string(),
            upstream_id: row.upstream_id.to_string(),
            relative_path: row.relative_path,
            size_bytes: row.size_bytes,
            content_type: row.content_type,
            etag: row.etag,
            checksum_sha1: row.checksum_sha1,
            checksum_md5: row.checksum_md5,
            checksum_sha256: row.checksum_sha256,
            integrity_verified: row.integrity_verified,
            needs_revalidation: row.needs_revalidation,
            upstream_checked_at: rfc3339(row.upstream_checked_at),
            download_count: row.download_count,
            last_downloaded_at: rfc3339_opt(row.last_downloaded_at),
            created_at: rfc3339(row.created_at),
        }
    }
}

/// GET /v1/upstreams/{upstream_id}/cache_entries
pub async fn list_cache_entries(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    Query(params): Query<ListEntriesParams>,
    req: Request,
) -> ApiResult<Json<Vec<CacheEntryResponse>>> {
    upstream_for(
        &state,
        &actor(&req),
        upstream_id,
        Capability::ManageRegistries,
    )
    .await?;

    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let rows = state
        .metadata
        .list_entries_for_upstream(upstream_id, limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// DELETE /v1/upstreams/{upstream_id}/cache_entries?path=
///
/// Idempotent: deleting an entry that is not cached still answers 204.
pub async fn delete_cache_entry(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    Query(params): Query<DeleteEntryParams>,
    req: Request,
) -> ApiResult<StatusCode> {
    let actor = actor(&req);
    upstream_for(&state, &actor, upstream_id, Capability::ManageRegistries).await?;
    let path = normalize_relative_path(&params.path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let deleted = state
        .metadata
        .delete_entry(upstream_id, &path, OffsetDateTime::now_utc())
        .await?;
    tracing::info!(
        upstream_id = %upstream_id,
        path = %path,
        existed = deleted.is_some(),
        actor = actor.display_name(),
        "cache entry invalidated"
    );
    Ok(StatusCode::NO_CONTENT)
}
