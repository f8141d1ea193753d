//! Configuration types shared across crates.

use crate::integrity::IntegrityPolicy;
use crate::registry::RegistryKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// Restrict this endpoint to scrapers at the network level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Maximum size of admin request bodies in bytes.
    #[serde(default = "default_admin_body_limit")]
    pub admin_body_limit_bytes: usize,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_admin_body_limit() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
            admin_body_limit_bytes: default_admin_body_limit(),
        }
    }
}

/// Static API token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Operator-facing name, used in logs.
    pub name: String,
    /// SHA256 hex of the bearer token.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
    /// Granted scopes (`registry:read`, `registry:cleanup`, `registry:admin`).
    #[serde(default = "default_token_scopes")]
    pub scopes: Vec<String>,
    /// Restrict the token to one group.
    #[serde(default)]
    pub group_id: Option<Uuid>,
}

fn default_token_scopes() -> Vec<String> {
    vec!["registry:read".to_string()]
}

/// Authentication configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Allow artifact pulls without a token.
    #[serde(default)]
    pub allow_anonymous_read: bool,
    /// Accepted bearer tokens.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl AuthConfig {
    /// Create a test configuration with an admin and a read-only token.
    ///
    /// **For testing only.** Tokens are `test-admin-token` and `test-read-token`.
    pub fn for_testing() -> Self {
        Self {
            allow_anonymous_read: false,
            tokens: vec![
                TokenConfig {
                    name: "test-admin".to_string(),
                    // SHA256 of "test-admin-token"
                    token_hash: "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
                        .to_string(),
                    scopes: vec!["registry:admin".to_string()],
                    group_id: None,
                },
                TokenConfig {
                    name: "test-read".to_string(),
                    // SHA256 of "test-read-token"
                    token_hash: "ee01576cac493eccf002b289602c136edfc517bb38881898e7faeea1aa07202c"
                        .to_string(),
                    scopes: vec!["registry:read".to_string()],
                    group_id: None,
                },
            ],
        }
    }

    /// Validate token entries.
    pub fn validate(&self) -> Result<(), String> {
        for token in &self.tokens {
            let hash = token.token_hash.trim_start_matches("sha256:");
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!(
                    "auth.tokens[{}].token_hash must be 64 hex characters",
                    token.name
                ));
            }
            for scope in &token.scopes {
                crate::authz::TokenScope::parse(scope)
                    .map_err(|e| format!("auth.tokens[{}]: {e}", token.name))?;
            }
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single instance deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Busy timeout in seconds while waiting on the database lock.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database (required when running several instances).
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer VREG_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Upstream fetch behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Longest an upstream attempt may wait for headers or for the next body
    /// chunk. A transfer that keeps making progress may run longer.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Connect timeout for upstream requests.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Attempts per upstream before falling through (minimum 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling for the retry backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Longest a request waits on an in-flight fetch before timing out.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Reject upstream bodies larger than this.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,
    /// User-Agent sent to upstreams.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_max_wait_secs() -> u64 {
    300
}

fn default_max_artifact_bytes() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

fn default_user_agent() -> String {
    format!("vreg/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_wait_secs: default_max_wait_secs(),
            max_artifact_bytes: default_max_artifact_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn attempt_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn max_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_wait_secs)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> std::time::Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        std::time::Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("fetch.max_attempts must be at least 1".to_string());
        }
        if self.attempt_timeout_secs == 0 || self.max_wait_secs == 0 {
            return Err("fetch timeouts must be greater than 0".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("fetch.initial_backoff_ms must not exceed max_backoff_ms".to_string());
        }
        Ok(())
    }
}

/// Cleanup scheduler configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between scheduler ticks looking for due policies.
    #[serde(default = "default_cleanup_tick_secs")]
    pub tick_interval_secs: u64,
    /// Entries deleted per batch.
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: u32,
    /// Upper bound on batches per run; remaining entries wait for the next run.
    #[serde(default = "default_cleanup_max_batches")]
    pub max_batches: u32,
    /// Pause between batches in milliseconds.
    #[serde(default)]
    pub batch_delay_ms: Option<u64>,
    /// A run still `running` this long after it started is reclaimed as
    /// failed on the next tick.
    #[serde(default = "default_cleanup_run_lease_secs")]
    pub run_lease_secs: u64,
    /// Attempts at recording a run's result before giving up.
    #[serde(default = "default_cleanup_finish_attempts")]
    pub finish_attempts: u32,
    /// Initial backoff between those attempts, doubled each time.
    #[serde(default = "default_cleanup_finish_backoff_ms")]
    pub finish_backoff_ms: u64,
}

fn default_cleanup_tick_secs() -> u64 {
    300
}

fn default_cleanup_run_lease_secs() -> u64 {
    6 * 60 * 60
}

fn default_cleanup_finish_attempts() -> u32 {
    5
}

fn default_cleanup_finish_backoff_ms() -> u64 {
    200
}

fn default_cleanup_batch_size() -> u32 {
    500
}

fn default_cleanup_max_batches() -> u32 {
    10_000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_cleanup_tick_secs(),
            batch_size: default_cleanup_batch_size(),
            max_batches: default_cleanup_max_batches(),
            batch_delay_ms: None,
            run_lease_secs: default_cleanup_run_lease_secs(),
            finish_attempts: default_cleanup_finish_attempts(),
            finish_backoff_ms: default_cleanup_finish_backoff_ms(),
        }
    }
}

impl CleanupConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    pub fn run_lease(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.run_lease_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_secs == 0 {
            return Err("cleanup.tick_interval_secs cannot be 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("cleanup.batch_size cannot be 0".to_string());
        }
        if self.run_lease_secs == 0 {
            return Err("cleanup.run_lease_secs cannot be 0".to_string());
        }
        if self.finish_attempts == 0 {
            return Err("cleanup.finish_attempts cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Blob deletion queue worker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobGcConfig {
    /// Interval between worker passes.
    #[serde(default = "default_blob_gc_interval_secs")]
    pub interval_secs: u64,
    /// Tasks claimed per pass.
    #[serde(default = "default_blob_gc_batch_size")]
    pub batch_size: u32,
    /// Attempts before a task is parked for operator attention.
    #[serde(default = "default_blob_gc_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_blob_gc_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Ceiling for the retry delay.
    #[serde(default = "default_blob_gc_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_blob_gc_interval_secs() -> u64 {
    60
}

fn default_blob_gc_batch_size() -> u32 {
    200
}

fn default_blob_gc_max_attempts() -> u32 {
    10
}

fn default_blob_gc_base_delay_secs() -> u64 {
    30
}

fn default_blob_gc_max_delay_secs() -> u64 {
    6 * 3600
}

impl Default for BlobGcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_blob_gc_interval_secs(),
            batch_size: default_blob_gc_batch_size(),
            max_attempts: default_blob_gc_max_attempts(),
            base_delay_secs: default_blob_gc_base_delay_secs(),
            max_delay_secs: default_blob_gc_max_delay_secs(),
        }
    }
}

impl BlobGcConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    /// Delay before the next attempt after `attempts` failures.
    pub fn retry_delay(&self, attempts: u32) -> time::Duration {
        let factor = 1u64 << attempts.saturating_sub(1).min(20);
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("blob_gc.interval_secs cannot be 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("blob_gc.batch_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Integrity policy per registry kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntegrityConfig {
    #[serde(default = "default_maven_integrity")]
    pub maven: IntegrityPolicy,
    #[serde(default = "default_npm_integrity")]
    pub npm: IntegrityPolicy,
    #[serde(default = "default_container_integrity")]
    pub container: IntegrityPolicy,
}

fn default_maven_integrity() -> IntegrityPolicy {
    IntegrityPolicy::default_for(RegistryKind::Maven)
}

fn default_npm_integrity() -> IntegrityPolicy {
    IntegrityPolicy::default_for(RegistryKind::Npm)
}

fn default_container_integrity() -> IntegrityPolicy {
    IntegrityPolicy::default_for(RegistryKind::Container)
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            maven: default_maven_integrity(),
            npm: default_npm_integrity(),
            container: default_container_integrity(),
        }
    }
}

impl IntegrityConfig {
    pub fn policy_for(&self, kind: RegistryKind) -> IntegrityPolicy {
        match kind {
            RegistryKind::Maven => self.maven,
            RegistryKind::Npm => self.npm,
            RegistryKind::Container => self.container,
        }
    }
}

/// Feature switches handed to the components that consult them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Serve a stale entry when every attempt against its upstream failed transiently.
    #[serde(default = "default_true")]
    pub serve_stale_on_error: bool,
    /// Record download counts and timestamps.
    #[serde(default = "default_true")]
    pub record_downloads: bool,
    /// Run the cleanup scheduler loop.
    #[serde(default = "default_true")]
    pub cleanup_scheduler: bool,
    /// Run the blob deletion worker loop.
    #[serde(default = "default_true")]
    pub blob_gc_worker: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            serve_stale_on_error: true,
            record_downloads: true,
            cleanup_scheduler: true,
            blob_gc_worker: true,
        }
    }
}

/// Where a secret comes from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SecretSource {
    /// Read from an environment variable at request time.
    Env { var: String },
    /// Read from a file at request time.
    File { path: PathBuf },
    /// Inline value (NOT recommended for production).
    Value { value: String },
}

/// Credentials an upstream references by name.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CredentialConfig {
    Basic {
        username: String,
        password: SecretSource,
    },
    Bearer {
        token: SecretSource,
    },
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub blob_gc: BlobGcConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    /// Upstream credentials keyed by the reference stored on the upstream.
    #[serde(default)]
    pub credentials: HashMap<String, CredentialConfig>,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata,
    /// fast retries and the test tokens from [`AuthConfig::for_testing`].
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::for_testing(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            fetch: FetchConfig {
                attempt_timeout_secs: 5,
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                max_wait_secs: 10,
                ..FetchConfig::default()
            },
            cleanup: CleanupConfig::default(),
            blob_gc: BlobGcConfig::default(),
            integrity: IntegrityConfig::default(),
            features: FeatureFlags::default(),
            credentials: HashMap::new(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.auth.validate()?;
        self.storage.validate()?;
        self.metadata.validate()?;
        self.fetch.validate()?;
        self.cleanup.validate()?;
        self.blob_gc.validate()?;
        Ok(())
    }
}
