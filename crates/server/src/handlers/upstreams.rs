//! Upstream administration and per-registry ordering.

use super::common::{actor, read_json, registry_for, rfc3339, upstream_for, validate_name};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::{Capability, DEFAULT_CACHE_VALIDITY_HOURS, RuleAction};
use vreg_metadata::models::UpstreamRow;

const MAX_DESCRIPTION_LEN: usize = 1024;

/// Body of `POST /v1/registries/{id}/upstreams`.
///
/// With `upstream_id` an existing upstream of the same group is attached;
/// otherwise a new upstream is created from the remaining fields.
#[derive(Debug, Deserialize)]
pub struct AttachUpstreamRequest {
    pub upstream_id: Option<Uuid>,
    pub position: Option<u32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub credential_ref: Option<String>,
    pub cache_validity_hours: Option<i32>,
    pub default_rule_action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUpstreamRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub credential_ref: Option<String>,
    pub cache_validity_hours: Option<i32>,
    pub default_rule_action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveUpstreamRequest {
    pub position: u32,
}

#[derive(Debug, Serialize)]
pub struct UpstreamResponse {
    pub upstream_id: String,
    pub group_id: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub url: String,
    pub credential_ref: Option<String>,
    pub cache_validity_hours: i32,
    pub default_rule_action: String,
    /// Position within the registry the upstream was listed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    pub created_at: String,
    pub updated_at: String,
}

impl UpstreamResponse {
    fn new(row: UpstreamRow, position: Option<i32>) -> Self {
        Self {
            upstream_id: row.upstream_id.to_string(),
            group_id: row.group_id.to_string(),
            name: row.name,
            description: row.description,
            kind: row.kind,
            url: row.url,
            credential_ref: row.credential_ref,
            cache_validity_hours: row.cache_validity_hours,
            default_rule_action: row.default_rule_action,
            position,
            created_at: rfc3339(row.created_at),
            updated_at: rfc3339(row.updated_at),
        }
    }
}

fn validate_url(url: &str) -> ApiResult<String> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| ApiError::BadRequest(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::BadRequest(
            "url must use http or https".to_string(),
        ));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(ApiError::BadRequest(
            "url must not carry a query or fragment".to_string(),
        ));
    }
    Ok(parsed.to_string())
}

fn validate_credential_ref(state: &AppState, reference: &str) -> ApiResult<()> {
    if state.config.credentials.contains_key(reference) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "unknown credential reference '{reference}'"
        )))
    }
}

fn validate_validity(hours: i32) -> ApiResult<()> {
    if hours < 0 {
        return Err(ApiError::BadRequest(
            "cache_validity_hours must not be negative".to_string(),
        ));
    }
    Ok(())
}

fn validate_description(description: &str) -> ApiResult<()> {
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(ApiError::BadRequest(format!(
            "description must be at most {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(())
}

/// POST /v1/registries/{registry_id}/upstreams
pub async fn attach_upstream(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<(StatusCode, Json<UpstreamResponse>)> {
    let actor = actor(&req);
    let registry =
        registry_for(&state, &actor, registry_id, Capability::ManageRegistries).await?;
    let body: AttachUpstreamRequest = read_json(&state, req).await?;

    if let Some(upstream_id) = body.upstream_id {
        let upstream =
            upstream_for(&state, &actor, upstream_id, Capability::ManageRegistries).await?;
        let position = state
            .metadata
            .attach_upstream(registry_id, upstream_id, body.position)
            .await?;
        tracing::info!(
            registry_id = %registry_id,
            upstream_id = %upstream_id,
            position,
            actor = actor.display_name(),
            "upstream attached"
        );
        return Ok((
            StatusCode::OK,
            Json(UpstreamResponse::new(upstream, Some(position as i32))),
        ));
    }

    let name = body
        .name
        .ok_or_else(|| ApiError::BadRequest("name is required".to_string()))?;
    validate_name("name", &name)?;
    let url = validate_url(
        body.url
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("url is required".to_string()))?,
    )?;
    let default_rule_action = RuleAction::parse(body.default_rule_action.as_deref().ok_or_else(
        || ApiError::BadRequest("default_rule_action is required (allow or deny)".to_string()),
    )?)?;
    if let Some(reference) = &body.credential_ref {
        validate_credential_ref(&state, reference)?;
    }
    if let Some(description) = &body.description {
        validate_description(description)?;
    }
    let cache_validity_hours = body
        .cache_validity_hours
        .unwrap_or(DEFAULT_CACHE_VALIDITY_HOURS);
    validate_validity(cache_validity_hours)?;

    let now = OffsetDateTime::now_utc();
    let upstream = UpstreamRow {
        upstream_id: Uuid::new_v4(),
        group_id: registry.group_id,
        name: name.trim().to_string(),
        description: body.description,
        kind: registry.kind.clone(),
        url,
        credential_ref: body.credential_ref,
        cache_validity_hours,
        default_rule_action: default_rule_action.as_str().to_string(),
        created_at: now,
        updated_at: now,
    };
    state.metadata.create_upstream(&upstream).await?;

    let position = match state
        .metadata
        .attach_upstream(registry_id, upstream.upstream_id, body.position)
        .await
    {
        Ok(position) => position,
        Err(e) => {
            // Do not leave an orphan behind when the registry is full.
            if let Err(cleanup) = state
                .metadata
                .delete_upstream(upstream.upstream_id, now)
                .await
            {
                tracing::error!(
                    upstream_id = %upstream.upstream_id,
                    error = %cleanup,
                    "failed to remove upstream after attach failure"
                );
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        registry_id = %registry_id,
        upstream_id = %upstream.upstream_id,
        position,
        actor = actor.display_name(),
        "upstream created"
    );
    Ok((
        StatusCode::CREATED,
        Json(UpstreamResponse::new(upstream, Some(position as i32))),
    ))
}

/// GET /v1/registries/{registry_id}/upstreams
pub async fn list_registry_upstreams(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<Vec<UpstreamResponse>>> {
    registry_for(
        &state,
        &actor(&req),
        registry_id,
        Capability::ManageRegistries,
    )
    .await?;
    let rows = state.metadata.list_registry_upstreams(registry_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|row| UpstreamResponse::new(row.upstream, Some(row.position)))
            .collect(),
    ))
}

/// PUT /v1/registries/{registry_id}/upstreams/{upstream_id}/position
pub async fn move_upstream(
    State(state): State<AppState>,
    Path((registry_id, upstream_id)): Path<(Uuid, Uuid)>,
    req: Request,
) -> ApiResult<Json<Vec<UpstreamResponse>>> {
    let actor = actor(&req);
    registry_for(&state, &actor, registry_id, Capability::ManageRegistries).await?;
    let body: MoveUpstreamRequest = read_json(&state, req).await?;

    state
        .metadata
        .move_upstream(registry_id, upstream_id, body.position)
        .await?;
    tracing::info!(
        registry_id = %registry_id,
        upstream_id = %upstream_id,
        position = body.position,
        actor = actor.display_name(),
        "upstream moved"
    );

    let rows = state.metadata.list_registry_upstreams(registry_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|row| UpstreamResponse::new(row.upstream, Some(row.position)))
            .collect(),
    ))
}

/// DELETE /v1/registries/{registry_id}/upstreams/{upstream_id}
pub async fn detach_upstream(
    State(state): State<AppState>,
    Path((registry_id, upstream_id)): Path<(Uuid, Uuid)>,
    req: Request,
) -> ApiResult<StatusCode> {
    let actor = actor(&req);
    registry_for(&state, &actor, registry_id, Capability::ManageRegistries).await?;
    state
        .metadata
        .detach_upstream(registry_id, upstream_id)
        .await?;
    tracing::info!(
        registry_id = %registry_id,
        upstream_id = %upstream_id,
        actor = actor.display_name(),
        "upstream detached"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/upstreams/{upstream_id}
pub async fn get_upstream(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<UpstreamResponse>> {
    let upstream = upstream_for(
        &state,
        &actor(&req),
        upstream_id,
        Capability::ManageRegistries,
    )
    .await?;
    Ok(Json(UpstreamResponse::new(upstream, None)))
}

/// PATCH /v1/upstreams/{upstream_id}
pub async fn update_upstream(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<UpstreamResponse>> {
    let actor = actor(&req);
    let mut upstream =
        upstream_for(&state, &actor, upstream_id, Capability::ManageRegistries).await?;
    let body: UpdateUpstreamRequest = read_json(&state, req).await?;

    if let Some(name) = body.name {
        validate_name("name", &name)?;
        upstream.name = name.trim().to_string();
    }
    if let Some(description) = body.description {
        validate_description(&description)?;
        upstream.description = Some(description).filter(|d| !d.is_empty());
    }
    if let Some(url) = body.url {
        upstream.url = validate_url(&url)?;
    }
    if let Some(reference) = body.credential_ref {
        if reference.is_empty() {
            upstream.credential_ref = None;
        } else {
            validate_credential_ref(&state, &reference)?;
            upstream.credential_ref = Some(reference);
        }
    }
    if let Some(hours) = body.cache_validity_hours {
        validate_validity(hours)?;
        upstream.cache_validity_hours = hours;
    }
    if let Some(action) = body.default_rule_action {
        upstream.default_rule_action = RuleAction::parse(&action)?.as_str().to_string();
    }
    upstream.updated_at = OffsetDateTime::now_utc();
    state.metadata.update_upstream(&upstream).await?;

    tracing::info!(upstream_id = %upstream_id, actor = actor.display_name(), "upstream updated");
    Ok(Json(UpstreamResponse::new(upstream, None)))
}

#[derive(Debug, Serialize)]
pub struct DeleteUpstreamResponse {
    pub entries_deleted: u64,
    pub blobs_enqueued: u64,
    pub registries_detached: u64,
}

/// DELETE /v1/upstreams/{upstream_id}
///
/// Removes the upstream with its rules and cache entries and detaches it
/// from every registry.
pub async fn delete_upstream(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<DeleteUpstreamResponse>> {
    let actor = actor(&req);
    upstream_for(&state, &actor, upstream_id, Capability::ManageRegistries).await?;
    let stats = state
        .metadata
        .delete_upstream(upstream_id, OffsetDateTime::now_utc())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upstream {upstream_id} not found")))?;

    tracing::info!(
        upstream_id = %upstream_id,
        entries_deleted = stats.entries_deleted,
        blobs_enqueued = stats.blobs_enqueued,
        actor = actor.display_name(),
        "upstream deleted"
    );
    Ok(Json(DeleteUpstreamResponse {
        entries_deleted: stats.entries_deleted,
        blobs_enqueued: stats.blobs_enqueued,
        registries_detached: stats.registries_detached,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert_eq!(
            validate_url("https://repo1.maven.org/maven2/").unwrap(),
            "https://repo1.maven.org/maven2/"
        );
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("https://example.com/?token=x").is_err());
    }

    #[test]
    fn test_negative_validity_rejected() {
        assert!(validate_validity(-1).is_err());
        assert!(validate_validity(0).is_ok());
    }
}
