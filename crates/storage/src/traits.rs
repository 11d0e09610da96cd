//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object store abstraction keyed by relative paths.
///
/// Keys use `/` as a separator. The first component of a key is its prefix;
/// prefixes group related objects (for example, all chunks of one session)
/// so they can be created, enumerated and removed together.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically. Readers never observe a partial object.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streaming upload.
    ///
    /// The object becomes visible under `key` only once the upload is
    /// finished. An upload that is aborted or dropped leaves nothing behind.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Create an empty prefix. Succeeds if it already exists.
    async fn create_prefix(&self, prefix: &str) -> StorageResult<()>;

    /// Delete a prefix and everything under it. Succeeds if it is absent.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<()>;

    /// List top-level prefixes.
    async fn list_prefixes(&self) -> StorageResult<Vec<PrefixMeta>>;

    /// Verify storage backend availability.
    ///
    /// Called during server startup to ensure the storage is usable before
    /// accepting requests.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a top-level prefix.
#[derive(Clone, Debug)]
pub struct PrefixMeta {
    /// Prefix name.
    pub name: String,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Bytes written so far.
    fn bytes_written(&self) -> u64;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
