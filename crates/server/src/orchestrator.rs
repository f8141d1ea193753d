//! Pull-through fetch orchestration.
//!
//! For a (registry, path) request the orchestrator walks the selected
//! upstreams in order: fresh cache entries are served directly, everything
//! else goes through one coalesced upstream fetch per (upstream, path).

use crate::error::FetchError;
use crate::metrics::{
    FETCH_DURATION, FETCHES_COALESCED, FETCHES_IN_FLIGHT, INTEGRITY_MISMATCHES, UPSTREAM_BYTES,
    record_cache_result, record_upstream_error,
};
use crate::selection::select_candidates;
use crate::singleflight::{Flight, SingleFlight};
use crate::upstream::{
    ChecksumHeaders, UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse,
    resolve_credential, upstream_url,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::checksum::normalize_hex;
use vreg_core::config::{CredentialConfig, FeatureFlags, FetchConfig, IntegrityConfig};
use vreg_core::{
    ArtifactHasher, ChecksumAlgorithm, Coordinate, DeclaredChecksums, RegistryKind, integrity,
};
use vreg_metadata::models::{CacheEntryRow, NewCacheEntry, RegistryRow, UpstreamRow};
use vreg_metadata::{MetadataError, MetadataStore};
use vreg_storage::{ObjectStore, StreamingUpload, new_blob_key};

/// How a served entry was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheSource {
    /// Fresh entry, no upstream contact.
    Hit,
    /// Fetched from the upstream and stored.
    Miss,
    /// Upstream answered 304; the entry was touched.
    Revalidated,
    /// Upstream failed transiently; a stale entry was served and flagged.
    Stale,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Revalidated => "revalidated",
            Self::Stale => "stale",
        }
    }
}

/// The entry a request resolved to.
#[derive(Clone, Debug)]
pub struct ServedArtifact {
    pub entry: CacheEntryRow,
    pub source: CacheSource,
}

type FlightKey = (Uuid, String);
type FlightResult = Result<ServedArtifact, FetchError>;

/// Static settings the orchestrator consults on every fetch.
#[derive(Clone, Debug)]
pub struct FetchSettings {
    pub fetch: FetchConfig,
    pub integrity: IntegrityConfig,
    pub features: FeatureFlags,
    pub credentials: HashMap<String, CredentialConfig>,
}

/// Serves artifacts from cache, falling through to upstreams.
#[derive(Clone)]
pub struct Orchestrator {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    client: Arc<dyn UpstreamClient>,
    settings: Arc<FetchSettings>,
    flights: SingleFlight<FlightKey, FlightResult>,
}

/// Failure of one upstream attempt.
enum AttemptError {
    /// Worth retrying (body transfer broke off).
    Transient(String),
    /// Stop trying this request.
    Fatal(FetchError),
}

/// Keeps the in-flight gauge honest even if a fetch task panics.
struct InFlightGauge;

impl InFlightGauge {
    fn start() -> Self {
        FETCHES_IN_FLIGHT.inc();
        Self
    }
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        FETCHES_IN_FLIGHT.dec();
    }
}

impl Orchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        client: Arc<dyn UpstreamClient>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            metadata,
            storage,
            client,
            settings: Arc::new(settings),
            flights: SingleFlight::new(),
        }
    }

    /// Number of upstream fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Resolve `relative_path` (already normalized) in `registry`.
    #[tracing::instrument(skip(self, registry), fields(registry_id = %registry.registry_id))]
    pub async fn serve(
        &self,
        registry: &RegistryRow,
        relative_path: &str,
    ) -> Result<ServedArtifact, FetchError> {
        let kind = registry
            .kind()
            .map_err(|e| FetchError::Internal(e.to_string()))?;
        let coordinate = Coordinate::parse(kind, relative_path);

        let candidates = select_candidates(self.metadata.as_ref(), registry, &coordinate).await?;
        if candidates.is_empty() {
            record_cache_result("no_upstream");
            return Err(FetchError::NoUpstreamAvailable);
        }

        let mut last_transient: Option<String> = None;
        for upstream in &candidates {
            let existing = self
                .metadata
                .lookup_entry(upstream.upstream_id, relative_path)
                .await?;
            if let Some(entry) = existing
                && entry.is_fresh(upstream.cache_validity(), OffsetDateTime::now_utc())
            {
                return Ok(self.served(ServedArtifact {
                    entry,
                    source: CacheSource::Hit,
                }));
            }

            match self.fetch_coalesced(upstream, kind, relative_path).await {
                Ok(served) => return Ok(self.served(served)),
                Err(FetchError::ArtifactNotFound) => {
                    tracing::debug!(
                        upstream_id = %upstream.upstream_id,
                        "upstream does not have the artifact, trying next"
                    );
                }
                Err(FetchError::UpstreamTransient(message)) => {
                    tracing::warn!(
                        upstream_id = %upstream.upstream_id,
                        error = %message,
                        "upstream unavailable, trying next"
                    );
                    last_transient = Some(message);
                }
                Err(other) => {
                    record_cache_result(other.label());
                    return Err(other);
                }
            }
        }

        match last_transient {
            Some(message) => {
                record_cache_result("upstream_error");
                Err(FetchError::UpstreamTransient(message))
            }
            None => {
                record_cache_result("not_found");
                Err(FetchError::ArtifactNotFound)
            }
        }
    }

    /// Count the result and record the download off the request path.
    fn served(&self, served: ServedArtifact) -> ServedArtifact {
        record_cache_result(served.source.as_str());
        if self.settings.features.record_downloads {
            let metadata = self.metadata.clone();
            let entry_id = served.entry.entry_id;
            tokio::spawn(async move {
                if let Err(e) = metadata
                    .record_download(entry_id, OffsetDateTime::now_utc())
                    .await
                {
                    tracing::warn!(entry_id = %entry_id, error = %e, "failed to record download");
                }
            });
        }
        served
    }

    /// Join or start the fetch for (upstream, path) and wait for its outcome.
    async fn fetch_coalesced(
        &self,
        upstream: &UpstreamRow,
        kind: RegistryKind,
        relative_path: &str,
    ) -> FlightResult {
        let key = (upstream.upstream_id, relative_path.to_string());
        let mut receiver = match self.flights.join(key) {
            Flight::Leader { guard, receiver } => {
                let this = self.clone();
                let upstream = upstream.clone();
                let path = relative_path.to_string();
                // Detached: a caller that goes away does not cancel the fetch.
                tokio::spawn(async move {
                    let _gauge = InFlightGauge::start();
                    let result = this.fetch_from_upstream(&upstream, kind, &path).await;
                    guard.complete(result);
                });
                receiver
            }
            Flight::Follower { receiver } => {
                FETCHES_COALESCED.inc();
                receiver
            }
        };

        match tokio::time::timeout(self.settings.fetch.max_wait(), receiver.recv()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FetchError::Internal(
                "upstream fetch ended without a result".to_string(),
            )),
            Err(_) => {
                tracing::warn!(
                    upstream_id = %upstream.upstream_id,
                    path = %relative_path,
                    "gave up waiting on in-flight fetch"
                );
                Err(FetchError::Timeout)
            }
        }
    }

    /// Body of a flight: revalidate or fetch, with retries and stale fallback.
    #[tracing::instrument(skip(self, upstream), fields(upstream_id = %upstream.upstream_id))]
    async fn fetch_from_upstream(
        &self,
        upstream: &UpstreamRow,
        kind: RegistryKind,
        relative_path: &str,
    ) -> FlightResult {
        let started = Instant::now();
        let fetch = &self.settings.fetch;

        // A flight that finished just before this one started may have
        // refreshed the entry already.
        let mut existing = self
            .metadata
            .lookup_entry(upstream.upstream_id, relative_path)
            .await?;
        if let Some(entry) = &existing
            && entry.is_fresh(upstream.cache_validity(), OffsetDateTime::now_utc())
        {
            return Ok(ServedArtifact {
                entry: entry.clone(),
                source: CacheSource::Hit,
            });
        }

        let credential = resolve_credential(
            &self.settings.credentials,
            upstream.credential_ref.as_deref(),
        )
        .map_err(FetchError::Internal)?;
        let url = upstream_url(&upstream.url, relative_path);
        let mut if_none_match = existing.as_ref().and_then(|e| e.etag.clone());

        let mut attempt = 0u32;
        let mut last_error: String;
        loop {
            attempt += 1;
            let request = UpstreamRequest {
                url: url.clone(),
                if_none_match: if_none_match.clone(),
                credential: credential.clone(),
            };

            match self.client.get(request).await {
                Ok(UpstreamResponse::Ok(body)) => {
                    match self.store_artifact(upstream, kind, relative_path, body).await {
                        Ok(entry) => {
                            FETCH_DURATION.observe(started.elapsed().as_secs_f64());
                            tracing::info!(
                                path = %relative_path,
                                size_bytes = entry.size_bytes,
                                attempt,
                                "stored artifact from upstream"
                            );
                            return Ok(ServedArtifact {
                                entry,
                                source: CacheSource::Miss,
                            });
                        }
                        Err(AttemptError::Fatal(e)) => return Err(e),
                        Err(AttemptError::Transient(message)) => {
                            record_upstream_error("body");
                            last_error = message;
                        }
                    }
                }
                Ok(UpstreamResponse::NotModified { etag }) if if_none_match.is_some() => {
                    let etag = etag.or_else(|| if_none_match.clone());
                    match self
                        .metadata
                        .touch_checked(
                            upstream.upstream_id,
                            relative_path,
                            etag.as_deref(),
                            OffsetDateTime::now_utc(),
                        )
                        .await?
                    {
                        Some(entry) => {
                            return Ok(ServedArtifact {
                                entry,
                                source: CacheSource::Revalidated,
                            });
                        }
                        None => {
                            // Evicted between lookup and touch: fetch the body.
                            tracing::debug!(path = %relative_path, "entry vanished during revalidation");
                            existing = None;
                            if_none_match = None;
                            continue;
                        }
                    }
                }
                Ok(UpstreamResponse::NotModified { .. }) => {
                    record_upstream_error("status");
                    last_error = "unexpected 304 to an unconditional request".to_string();
                }
                Ok(UpstreamResponse::NotFound { status }) => {
                    tracing::debug!(path = %relative_path, status, "upstream returned not found");
                    return Err(FetchError::ArtifactNotFound);
                }
                Err(e) => {
                    record_upstream_error(e.class());
                    tracing::warn!(path = %relative_path, attempt, error = %e, "upstream attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt >= fetch.max_attempts {
                break;
            }
            tokio::time::sleep(fetch.backoff_for(attempt)).await;
        }

        if self.settings.features.serve_stale_on_error
            && let Some(mut entry) = existing
        {
            self.metadata
                .mark_needs_revalidation(upstream.upstream_id, relative_path)
                .await?;
            entry.needs_revalidation = true;
            tracing::warn!(
                path = %relative_path,
                error = %last_error,
                "upstream failing, serving stale entry"
            );
            return Ok(ServedArtifact {
                entry,
                source: CacheSource::Stale,
            });
        }

        Err(FetchError::UpstreamTransient(last_error))
    }

    /// Stream a body into a fresh blob, verify it and upsert the entry.
    async fn store_artifact(
        &self,
        upstream: &UpstreamRow,
        kind: RegistryKind,
        relative_path: &str,
        body: UpstreamBody,
    ) -> Result<CacheEntryRow, AttemptError> {
        let limit = self.settings.fetch.max_artifact_bytes;
        if let Some(length) = body.content_length
            && length > limit
        {
            return Err(AttemptError::Fatal(FetchError::TooLarge { limit }));
        }

        let UpstreamBody {
            content_type,
            etag,
            checksums: declared_headers,
            body: mut stream,
            ..
        } = body;

        let policy = self.settings.integrity.policy_for(kind);
        let object_key = new_blob_key(upstream.upstream_id);
        let mut upload = self
            .storage
            .put_stream(&object_key)
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;
        let mut hasher = ArtifactHasher::new(policy.compute_md5);

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    abort_upload(upload, &object_key).await;
                    return Err(AttemptError::Transient(format!("body transfer failed: {e}")));
                }
            };
            if hasher.size() + chunk.len() as u64 > limit {
                abort_upload(upload, &object_key).await;
                return Err(AttemptError::Fatal(FetchError::TooLarge { limit }));
            }
            hasher.update(&chunk);
            if let Err(e) = upload.write(chunk).await {
                abort_upload(upload, &object_key).await;
                return Err(AttemptError::Fatal(e.into()));
            }
        }
        let size = upload
            .finish()
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;
        let computed = hasher.finalize();

        let declared = declared_checksums(kind, &declared_headers);
        let integrity_verified = match integrity::verify(&policy, &declared, &computed) {
            Ok(verified) => verified,
            Err(e) => {
                INTEGRITY_MISMATCHES.inc();
                tracing::error!(
                    upstream_id = %upstream.upstream_id,
                    path = %relative_path,
                    error = %e,
                    "integrity check failed, discarding artifact"
                );
                self.discard_blob(&object_key).await;
                return Err(AttemptError::Fatal(FetchError::IntegrityMismatch(
                    e.to_string(),
                )));
            }
        };

        let entry = NewCacheEntry {
            upstream_id: upstream.upstream_id,
            group_id: upstream.group_id,
            relative_path: relative_path.to_string(),
            object_key: object_key.clone(),
            size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
            content_type: Some(
                content_type.unwrap_or_else(|| kind.fallback_content_type().to_string()),
            ),
            etag,
            checksum_sha1: computed.sha1,
            checksum_md5: computed.md5,
            checksum_sha256: computed.sha256,
            integrity_verified,
            checked_at: OffsetDateTime::now_utc(),
        };

        let stored = match self.metadata.upsert_entry(&entry).await {
            Err(MetadataError::Constraint(first)) => {
                let current = self
                    .metadata
                    .lookup_entry(upstream.upstream_id, relative_path)
                    .await;
                tracing::warn!(
                    path = %relative_path,
                    error = %first,
                    row_present = matches!(current, Ok(Some(_))),
                    "cache entry upsert conflicted, retrying"
                );
                self.metadata.upsert_entry(&entry).await
            }
            other => other,
        };

        match stored {
            Ok(row) => {
                UPSTREAM_BYTES.inc_by(size);
                Ok(row)
            }
            Err(MetadataError::Constraint(message)) => {
                self.discard_blob(&object_key).await;
                Err(AttemptError::Fatal(FetchError::StoreConflict(message)))
            }
            Err(e) => {
                self.discard_blob(&object_key).await;
                Err(AttemptError::Fatal(e.into()))
            }
        }
    }

    /// Remove a blob no entry references. Failures are queued for the worker.
    async fn discard_blob(&self, object_key: &str) {
        match self.storage.delete(object_key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(object_key, error = %e, "failed to delete unreferenced blob, queueing");
                if let Err(e) = self
                    .metadata
                    .enqueue_blob_deletion(object_key, OffsetDateTime::now_utc())
                    .await
                {
                    tracing::error!(object_key, error = %e, "failed to queue blob deletion");
                }
            }
        }
    }
}

async fn abort_upload(upload: Box<dyn StreamingUpload>, object_key: &str) {
    if let Err(e) = upload.abort().await {
        tracing::warn!(object_key, error = %e, "failed to abort upload");
    }
}

/// Checksums the upstream declared, per registry kind.
///
/// Malformed values are dropped with a warning rather than failing the fetch.
pub fn declared_checksums(kind: RegistryKind, headers: &ChecksumHeaders) -> DeclaredChecksums {
    let parse = |algorithm: ChecksumAlgorithm, value: Option<&str>| {
        let value = value?;
        match normalize_hex(algorithm, value) {
            Ok(hex) => Some(hex),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed declared checksum");
                None
            }
        }
    };

    match kind {
        RegistryKind::Maven => DeclaredChecksums {
            sha1: parse(ChecksumAlgorithm::Sha1, headers.sha1.as_deref()),
            md5: parse(ChecksumAlgorithm::Md5, headers.md5.as_deref()),
            sha256: None,
        },
        RegistryKind::Container => DeclaredChecksums {
            sha256: parse(
                ChecksumAlgorithm::Sha256,
                headers
                    .content_digest
                    .as_deref()
                    .and_then(|d| d.strip_prefix("sha256:")),
            ),
            ..Default::default()
        },
        RegistryKind::Npm => DeclaredChecksums::default(),
    }
}
