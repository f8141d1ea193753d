//! Registry administration.

use super::common::{actor, read_json, registry_for, rfc3339, validate_name};
use crate::auth::authorize;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::{Capability, RegistryKind};
use vreg_metadata::models::RegistryRow;

#[derive(Debug, Deserialize)]
pub struct CreateRegistryRequest {
    pub name: String,
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UpdateRegistryRequest {
    pub name: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RegistryResponse {
    pub registry_id: String,
    pub group_id: String,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<RegistryRow> for RegistryResponse {
    fn from(row: RegistryRow) -> Self {
        Self {
            registry_id: row.registry_id.to_string(),
            group_id: row.group_id.to_string(),
            name: row.name,
            kind: row.kind,
            enabled: row.enabled,
            created_at: rfc3339(row.created_at),
            updated_at: rfc3339(row.updated_at),
        }
    }
}

/// POST /v1/groups/{group_id}/registries
pub async fn create_registry(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<(StatusCode, Json<RegistryResponse>)> {
    let actor = actor(&req);
    authorize(&state, &actor, Capability::ManageRegistries, group_id)?;
    let body: CreateRegistryRequest = read_json(&state, req).await?;

    validate_name("name", &body.name)?;
    let kind = RegistryKind::parse(&body.kind)?;

    let now = OffsetDateTime::now_utc();
    let row = RegistryRow {
        registry_id: Uuid::new_v4(),
        group_id,
        name: body.name.trim().to_string(),
        kind: kind.as_str().to_string(),
        enabled: body.enabled,
        created_at: now,
        updated_at: now,
    };
    state.metadata.create_registry(&row).await?;

    tracing::info!(
        registry_id = %row.registry_id,
        group_id = %group_id,
        kind = kind.as_str(),
        actor = actor.display_name(),
        "registry created"
    );
    Ok((StatusCode::CREATED, Json(row.into())))
}

/// GET /v1/groups/{group_id}/registries
pub async fn list_registries(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<Vec<RegistryResponse>>> {
    authorize(&state, &actor(&req), Capability::ManageRegistries, group_id)?;
    let rows = state.metadata.list_registries(group_id).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// GET /v1/registries/{registry_id}
pub async fn get_registry(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<RegistryResponse>> {
    let registry = registry_for(
        &state,
        &actor(&req),
        registry_id,
        Capability::ManageRegistries,
    )
    .await?;
    Ok(Json(registry.into()))
}

/// PATCH /v1/registries/{registry_id}
pub async fn update_registry(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<RegistryResponse>> {
    let actor = actor(&req);
    let mut registry =
        registry_for(&state, &actor, registry_id, Capability::ManageRegistries).await?;
    let body: UpdateRegistryRequest = read_json(&state, req).await?;

    if let Some(name) = body.name {
        validate_name("name", &name)?;
        registry.name = name.trim().to_string();
    }
    if let Some(enabled) = body.enabled {
        registry.enabled = enabled;
    }
    registry.updated_at = OffsetDateTime::now_utc();
    state.metadata.update_registry(&registry).await?;

    tracing::info!(
        registry_id = %registry_id,
        enabled = registry.enabled,
        actor = actor.display_name(),
        "registry updated"
    );
    Ok(Json(registry.into()))
}

/// DELETE /v1/registries/{registry_id}
///
/// Detaches the registry's upstreams; the upstreams and their cache entries
/// are kept.
pub async fn delete_registry(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<StatusCode> {
    let actor = actor(&req);
    registry_for(&state, &actor, registry_id, Capability::ManageRegistries).await?;
    if !state.metadata.delete_registry(registry_id).await? {
        return Err(ApiError::NotFound(format!("registry {registry_id} not found")));
    }
    tracing::info!(registry_id = %registry_id, actor = actor.display_name(), "registry deleted");
    Ok(StatusCode::NO_CONTENT)
}
