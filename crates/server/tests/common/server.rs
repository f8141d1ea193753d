//! Server test utilities.

use super::upstream::ScriptedUpstream;
use std::sync::Arc;
use tempfile::TempDir;
use vreg_core::config::{AppConfig, MetadataConfig, StorageConfig};
use vreg_metadata::{MetadataStore, SqliteStore};
use vreg_server::upstream::UpstreamClient;
use vreg_server::{AppState, HttpUpstreamClient, create_router};
use vreg_storage::{FilesystemBackend, ObjectStore};

/// Bearer secret of the `registry:admin` test token.
#[allow(dead_code)]
pub const ADMIN_TOKEN: &str = "test-admin-token";
/// Bearer secret of the `registry:read` test token.
#[allow(dead_code)]
pub const READ_TOKEN: &str = "test-read-token";

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    /// Present when the server was built with the scripted upstream.
    pub upstream: Option<Arc<ScriptedUpstream>>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Server with the scripted upstream client.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Server with the scripted upstream and custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let upstream = Arc::new(ScriptedUpstream::new());
        let mut server = Self::build(modifier, |_| upstream.clone()).await;
        server.upstream = Some(upstream);
        server
    }

    /// Server that talks HTTP to real (mock) upstreams.
    pub async fn with_http_client<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, |config| {
            Arc::new(
                HttpUpstreamClient::new(&config.fetch).expect("Failed to build HTTP client"),
            )
        })
        .await
    }

    async fn build<F, C>(modifier: F, client: C) -> Self
    where
        F: FnOnce(&mut AppConfig),
        C: FnOnce(&AppConfig) -> Arc<dyn UpstreamClient>,
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig {
            storage: StorageConfig::Filesystem {
                path: storage_path.clone(),
            },
            metadata: MetadataConfig::Sqlite {
                path: db_path,
                query_timeout_secs: None,
            },
            ..AppConfig::for_testing()
        };
        modifier(&mut config);

        let client = client(&config);
        let state =
            AppState::new(config, storage, metadata, client).expect("Failed to build app state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            upstream: None,
            _temp_dir: temp_dir,
        }
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    pub fn storage(&self) -> Arc<dyn ObjectStore> {
        self.state.storage.clone()
    }

    /// The scripted upstream; panics for servers built with the HTTP client.
    pub fn upstream(&self) -> &ScriptedUpstream {
        self.upstream
            .as_deref()
            .expect("server was built without the scripted upstream")
    }
}
