//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Blob storage used for cached artifact bodies.
///
/// Keys are relative, `/`-separated paths. The cache writes every artifact
/// under a freshly generated key, so backends never see two writers racing on
/// the same key.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get object metadata.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Read a whole object into memory.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Stream an object.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Write a whole object.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Begin a streaming write. Nothing is visible under `key` until
    /// [`StreamingUpload::finish`] succeeds.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object. Returns `StorageError::NotFound` if it is missing.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List keys under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and writable.
    ///
    /// The default implementation only checks that listing works.
    async fn health_check(&self) -> StorageResult<()> {
        self.list("").await.map(|_| ())
    }
}

/// Object metadata.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Size in bytes.
    pub size: u64,
    /// Last modified time.
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type, if the backend records one.
    pub content_type: Option<String>,
}

/// An in-progress streaming write.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Append a chunk.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Commit the object and return its size.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
