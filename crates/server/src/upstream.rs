//! Upstream HTTP client.
//!
//! The orchestrator talks to upstreams through [`UpstreamClient`] so tests can
//! point it at a mock server; [`HttpUpstreamClient`] is the reqwest
//! implementation used in production.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, IF_NONE_MATCH};
use std::collections::HashMap;
use vreg_core::config::{CredentialConfig, FetchConfig, SecretSource};
use vreg_storage::{ByteStream, StorageError};

/// Credential material sent to an upstream.
#[derive(Clone)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Resolve an upstream's credential reference against configuration.
///
/// Secrets are read at request time so rotated env vars and files take effect
/// without a restart.
pub fn resolve_credential(
    credentials: &HashMap<String, CredentialConfig>,
    reference: Option<&str>,
) -> Result<Option<Credential>, String> {
    let Some(reference) = reference else {
        return Ok(None);
    };
    let config = credentials
        .get(reference)
        .ok_or_else(|| format!("unknown credential reference '{reference}'"))?;

    let credential = match config {
        CredentialConfig::Basic { username, password } => Credential::Basic {
            username: username.clone(),
            password: read_secret(password)?,
        },
        CredentialConfig::Bearer { token } => Credential::Bearer(read_secret(token)?),
    };
    Ok(Some(credential))
}

fn read_secret(source: &SecretSource) -> Result<String, String> {
    match source {
        SecretSource::Env { var } => {
            std::env::var(var).map_err(|_| format!("environment variable {var} is not set"))
        }
        SecretSource::File { path } => std::fs::read_to_string(path)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| format!("failed to read secret file {}: {e}", path.display())),
        SecretSource::Value { value } => Ok(value.clone()),
    }
}

/// One GET against an upstream.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    /// ETag of the cached copy, sent as `If-None-Match`.
    pub if_none_match: Option<String>,
    pub credential: Option<Credential>,
}

/// Integrity-relevant headers an upstream sent with a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumHeaders {
    pub sha1: Option<String>,
    pub md5: Option<String>,
    /// `Docker-Content-Digest`, e.g. `sha256:…`.
    pub content_digest: Option<String>,
}

impl ChecksumHeaders {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            sha1: get("x-checksum-sha1"),
            md5: get("x-checksum-md5"),
            content_digest: get("docker-content-digest"),
        }
    }
}

/// A successful response with a body still to be read.
pub struct UpstreamBody {
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub checksums: ChecksumHeaders,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamBody")
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Classified upstream response.
#[derive(Debug)]
pub enum UpstreamResponse {
    Ok(UpstreamBody),
    NotModified { etag: Option<String> },
    /// 404, or another non-retryable 4xx; the next candidate is tried.
    NotFound { status: u16 },
}

/// Upstream failures worth retrying.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("upstream connection failed: {0}")]
    Connect(String),
    #[error("upstream returned {0}")]
    Status(u16),
    #[error("upstream request failed: {0}")]
    Other(String),
}

impl UpstreamError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connect(_) => "connect",
            Self::Status(_) => "status",
            Self::Other(_) => "other",
        }
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn get(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// reqwest-backed upstream client.
pub struct HttpUpstreamClient {
    http: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            // Idle limit per read; a large body that keeps arriving is not cut off.
            .read_timeout(config.attempt_timeout())
            .build()?;
        Ok(Self { http })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(err.to_string())
    } else if err.is_connect() {
        UpstreamError::Connect(err.to_string())
    } else {
        UpstreamError::Other(err.to_string())
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Map a status to a response class; `None` means the body should be read.
fn classify_status(status: StatusCode) -> Option<Result<UpstreamResponse, UpstreamError>> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::NOT_MODIFIED {
        return Some(Ok(UpstreamResponse::NotModified { etag: None }));
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return Some(Err(UpstreamError::Status(status.as_u16())));
    }
    if status.is_client_error() {
        if status != StatusCode::NOT_FOUND {
            tracing::warn!(status = status.as_u16(), "upstream rejected request, treating as not found");
        }
        return Some(Ok(UpstreamResponse::NotFound {
            status: status.as_u16(),
        }));
    }
    // 1xx/3xx that reqwest did not follow.
    Some(Err(UpstreamError::Status(status.as_u16())))
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn get(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let mut builder = self.http.get(&request.url);
        if let Some(etag) = &request.if_none_match {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        builder = match &request.credential {
            Some(Credential::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(Credential::Bearer(token)) => builder.bearer_auth(token),
            None => builder,
        };

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();

        if let Some(classified) = classify_status(status) {
            return match classified {
                Ok(UpstreamResponse::NotModified { .. }) => Ok(UpstreamResponse::NotModified {
                    etag: header_string(&headers, ETAG),
                }),
                other => other,
            };
        }

        let content_length = header_string(&headers, CONTENT_LENGTH).and_then(|v| v.parse().ok());
        let body: ByteStream = Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| StorageError::Io(std::io::Error::other(e)))
        }));

        Ok(UpstreamResponse::Ok(UpstreamBody {
            content_type: header_string(&headers, CONTENT_TYPE),
            etag: header_string(&headers, ETAG),
            content_length,
            checksums: ChecksumHeaders::from_headers(&headers),
            body,
        }))
    }
}

/// Join an upstream base URL and a relative path.
pub fn upstream_url(base: &str, relative_path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative_path.trim_start_matches('/')
    )
}
