//! Artifact fetch endpoint.
//!
//! Every not-found cause (unknown kind, unknown or disabled registry, no
//! eligible upstream, artifact missing upstream) renders the same 404 so a
//! caller cannot probe which registries exist.

use super::common::actor;
use crate::auth::{authorize, reject_anonymous_unless_allowed};
use crate::error::{ApiError, ApiResult};
use crate::metrics::SERVED_BYTES;
use crate::orchestrator::ServedArtifact;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use uuid::Uuid;
use vreg_core::registry::normalize_relative_path;
use vreg_core::{Capability, RegistryKind};

static X_CHECKSUM_SHA1: HeaderName = HeaderName::from_static("x-checksum-sha1");
static X_CHECKSUM_MD5: HeaderName = HeaderName::from_static("x-checksum-md5");
static X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// GET /v1/virtual_registries/{kind}/{registry_id}/{*path}
pub async fn get_artifact(
    State(state): State<AppState>,
    Path((kind, registry_id, path)): Path<(String, String, String)>,
    req: Request,
) -> ApiResult<Response> {
    let actor = actor(&req);
    let if_none_match = req
        .headers()
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    drop(req);

    reject_anonymous_unless_allowed(&state, &actor)?;

    let kind = RegistryKind::parse(&kind).map_err(|_| ApiError::ArtifactNotFound)?;
    let registry_id = Uuid::parse_str(&registry_id).map_err(|_| ApiError::ArtifactNotFound)?;
    let path = normalize_relative_path(&path).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let registry = state
        .metadata
        .get_registry(registry_id)
        .await?
        .filter(|r| r.enabled && r.kind == kind.as_str())
        .ok_or(ApiError::ArtifactNotFound)?;
    authorize(&state, &actor, Capability::ReadArtifacts, registry.group_id)?;

    let served = state.orchestrator.serve(&registry, &path).await?;
    let etag = served_etag(&served);

    if let Some(candidates) = if_none_match.as_deref()
        && etag_matches(candidates, &etag)
    {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, ETAG, &etag);
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    let stream = match state.storage.get_stream(&served.entry.object_key).await {
        Ok(stream) => stream,
        Err(e) if e.is_not_found() => {
            // Evicted or replaced between lookup and read.
            tracing::warn!(
                entry_id = %served.entry.entry_id,
                object_key = %served.entry.object_key,
                "cached blob vanished before it could be served"
            );
            return Err(ApiError::ArtifactNotFound);
        }
        Err(e) => return Err(e.into()),
    };

    let entry_id = served.entry.entry_id;
    let body_stream = stream.map(move |chunk| match chunk {
        Ok(bytes) => {
            SERVED_BYTES.inc_by(bytes.len() as u64);
            Ok(bytes)
        }
        Err(e) => {
            tracing::error!(entry_id = %entry_id, error = %e, "artifact streaming failed mid-transfer");
            Err(std::io::Error::other(e.to_string()))
        }
    });

    let entry = &served.entry;
    let mut headers = HeaderMap::new();
    let content_type = entry
        .content_type
        .as_deref()
        .unwrap_or_else(|| kind.fallback_content_type());
    insert_header(&mut headers, CONTENT_TYPE, content_type);
    insert_header(&mut headers, CONTENT_LENGTH, &entry.size_bytes.to_string());
    insert_header(&mut headers, ETAG, &etag);
    insert_header(&mut headers, X_CHECKSUM_SHA1.clone(), &entry.checksum_sha1);
    if let Some(md5) = &entry.checksum_md5 {
        insert_header(&mut headers, X_CHECKSUM_MD5.clone(), md5);
    }
    insert_header(&mut headers, X_CACHE.clone(), served.source.as_str());

    Ok((StatusCode::OK, headers, Body::from_stream(body_stream)).into_response())
}

/// The upstream's ETag, or the quoted SHA-256 when it sent none.
fn served_etag(served: &ServedArtifact) -> String {
    match &served.entry.etag {
        Some(etag) if !etag.is_empty() => etag.clone(),
        _ => format!("\"{}\"", served.entry.checksum_sha256),
    }
}

/// Weak comparison per RFC 9110: `W/` prefixes are ignored.
fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let strip = |t: &str| t.trim().trim_start_matches("W/").to_string();
    let current = strip(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip(candidate) == current)
}

/// Values that are not valid header text are skipped with a warning.
fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => tracing::warn!(header = %name, "dropping header with invalid value"),
    }
}
