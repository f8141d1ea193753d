//! Shared handler helpers.

use crate::auth::authorize;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::Request;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;
use vreg_core::{Actor, Capability};
use vreg_metadata::models::{RegistryRow, UpstreamRow};

/// Maximum length of registry and upstream names.
pub const MAX_NAME_LEN: usize = 255;

/// The caller resolved by the auth middleware.
pub fn actor(req: &Request) -> Actor {
    req.extensions()
        .get::<Actor>()
        .cloned()
        .unwrap_or(Actor::Anonymous)
}

/// Read and parse a JSON request body, bounded by the admin body limit.
pub async fn read_json<T: DeserializeOwned>(state: &AppState, req: Request) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), state.config.server.admin_body_limit_bytes)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

pub fn validate_name(field: &str, name: &str) -> ApiResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "{field} must be between 1 and {MAX_NAME_LEN} characters"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ApiError::BadRequest(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Load a registry and check `capability` on its group.
pub async fn registry_for(
    state: &AppState,
    actor: &Actor,
    registry_id: Uuid,
    capability: Capability,
) -> ApiResult<RegistryRow> {
    let registry = state
        .metadata
        .get_registry(registry_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("registry {registry_id} not found")))?;
    authorize(state, actor, capability, registry.group_id)?;
    Ok(registry)
}

/// Load an upstream and check `capability` on its group.
pub async fn upstream_for(
    state: &AppState,
    actor: &Actor,
    upstream_id: Uuid,
    capability: Capability,
) -> ApiResult<UpstreamRow> {
    let upstream = state
        .metadata
        .get_upstream(upstream_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upstream {upstream_id} not found")))?;
    authorize(state, actor, capability, upstream.group_id)?;
    Ok(upstream)
}

/// Format a timestamp for JSON responses.
pub fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

pub fn rfc3339_opt(ts: Option<OffsetDateTime>) -> Option<String> {
    ts.map(rfc3339)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("name", "maven-central").is_ok());
        assert!(validate_name("name", "  ").is_err());
        assert!(validate_name("name", &"x".repeat(256)).is_err());
        assert!(validate_name("name", "bad\nname").is_err());
    }

    #[test]
    fn test_rfc3339() {
        let ts = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(rfc3339(ts), "1970-01-01T00:00:00Z");
    }
}
