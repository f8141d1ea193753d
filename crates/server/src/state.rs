//! Application state shared across handlers.

use crate::auth::TokenTable;
use crate::blob_gc::BlobGcWorker;
use crate::cleanup::{CleanupRunner, LogNotifier, Notifier};
use crate::orchestrator::{FetchSettings, Orchestrator};
use crate::upstream::UpstreamClient;
use std::sync::Arc;
use vreg_core::Policy;
use vreg_core::config::AppConfig;
use vreg_metadata::MetadataStore;
use vreg_storage::ObjectStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    pub orchestrator: Orchestrator,
    pub cleanup: Arc<CleanupRunner>,
    pub blob_gc: Arc<BlobGcWorker>,
    /// Capability checks applied to every operation.
    pub policy: Arc<Policy>,
    pub tokens: Arc<TokenTable>,
}

impl AppState {
    /// Create the application state, validating configuration first.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<Self, String> {
        Self::with_notifier(config, storage, metadata, client, Arc::new(LogNotifier))
    }

    /// Like [`AppState::new`] with a custom cleanup notifier.
    pub fn with_notifier(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        client: Arc<dyn UpstreamClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, String> {
        config.validate()?;
        let tokens = TokenTable::from_config(&config.auth)?;
        if tokens.is_empty() && !config.auth.allow_anonymous_read {
            tracing::warn!("no API tokens configured and anonymous read disabled");
        }

        let orchestrator = Orchestrator::new(
            metadata.clone(),
            storage.clone(),
            client,
            FetchSettings {
                fetch: config.fetch.clone(),
                integrity: config.integrity.clone(),
                features: config.features,
                credentials: config.credentials.clone(),
            },
        );
        let cleanup = Arc::new(CleanupRunner::new(
            metadata.clone(),
            config.cleanup.clone(),
            notifier,
        ));
        let blob_gc = Arc::new(BlobGcWorker::new(
            metadata.clone(),
            storage.clone(),
            config.blob_gc.clone(),
        ));
        let policy = Arc::new(Policy::standard(config.auth.allow_anonymous_read));

        Ok(Self {
            config: Arc::new(config),
            storage,
            metadata,
            orchestrator,
            cleanup,
            blob_gc,
            policy,
            tokens: Arc::new(tokens),
        })
    }
}
