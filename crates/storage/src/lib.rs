//! Blob storage for the virtual registry cache.
//!
//! Artifact bodies live in an object store addressed by generated keys of the
//! form `blobs/{upstream_id}/{uuid}`. Metadata (and the key a cache entry
//! points at) lives in the metadata crate; this crate only moves bytes.
//!
//! Backends: local filesystem and S3-compatible.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};

use std::sync::Arc;
use uuid::Uuid;
use vreg_core::config::StorageConfig;

/// Prefix shared by every cached artifact body.
pub const BLOB_PREFIX: &str = "blobs";

/// Generate a fresh object key for a blob fetched from `upstream_id`.
pub fn new_blob_key(upstream_id: Uuid) -> String {
    format!("{BLOB_PREFIX}/{upstream_id}/{}", Uuid::new_v4())
}

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[test]
    fn blob_keys_are_unique_per_call() {
        let upstream = Uuid::new_v4();
        let a = new_blob_key(upstream);
        let b = new_blob_key(upstream);
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("blobs/{upstream}/")));
    }

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        let key = new_blob_key(Uuid::new_v4());
        store.put(&key, Bytes::from_static(b"hi")).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
    }

    #[tokio::test]
    async fn from_config_s3_ok() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("vreg".to_string()),
            access_key_id: Some("access".to_string()),
            secret_access_key: Some("secret".to_string()),
            force_path_style: true,
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "s3");
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        let err = from_config(&config).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
