//! Chunk scratch area for in-progress uploads.
//!
//! Each session owns one prefix named after its upload id. Chunk `i` of a
//! session is stored at `<upload_id>/<i>`. Single-shot uploads are staged
//! under [`STAGING_PREFIX`], which can never collide with an upload id.

use crate::error::StorageResult;
use crate::traits::{ByteStream, ObjectStore, PrefixMeta, StreamingUpload};
use bytes::Bytes;
use courier_core::UploadId;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Prefix holding staged single-shot upload bodies.
pub const STAGING_PREFIX: &str = ".staging";

/// Chunk storage keyed by session and chunk index.
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<dyn ObjectStore>,
}

impl ChunkStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    fn chunk_key(upload_id: &UploadId, index: u32) -> String {
        format!("{upload_id}/{index}")
    }

    /// Allocate working storage for a session.
    pub async fn create_session(&self, upload_id: &UploadId) -> StorageResult<()> {
        self.inner.create_prefix(upload_id.as_str()).await
    }

    /// Durably write one chunk. Rewriting an index replaces it atomically.
    pub async fn write_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
        data: Bytes,
    ) -> StorageResult<()> {
        let len = data.len();
        self.inner
            .put(&Self::chunk_key(upload_id, index), data)
            .await?;
        debug!(upload_id = %upload_id, index, size = len, "Stored chunk");
        Ok(())
    }

    /// Open chunk `index` for reading.
    ///
    /// Fails with `StorageError::NotFound` if the chunk is absent.
    pub async fn open_chunk(&self, upload_id: &UploadId, index: u32) -> StorageResult<ByteStream> {
        self.inner
            .get_stream(&Self::chunk_key(upload_id, index))
            .await
    }

    /// Remove all storage of a session. Absent sessions are ignored.
    pub async fn remove_session(&self, upload_id: &UploadId) -> StorageResult<()> {
        self.inner.delete_prefix(upload_id.as_str()).await
    }

    /// Remove a top-level prefix by name, as reported by [`Self::list_sessions`].
    pub async fn remove_prefix(&self, name: &str) -> StorageResult<()> {
        self.inner.delete_prefix(name).await
    }

    /// List session prefixes present on disk.
    ///
    /// The staging prefix is excluded.
    pub async fn list_sessions(&self) -> StorageResult<Vec<PrefixMeta>> {
        let mut prefixes = self.inner.list_prefixes().await?;
        prefixes.retain(|p| p.name != STAGING_PREFIX);
        Ok(prefixes)
    }

    /// Start staging a single-shot upload body.
    ///
    /// Returns the staging key and the open upload. The key can be read back
    /// with [`Self::open_staged`] once the upload is finished.
    pub async fn stage(&self) -> StorageResult<(String, Box<dyn StreamingUpload>)> {
        let key = format!("{STAGING_PREFIX}/{}", Uuid::new_v4());
        let upload = self.inner.put_stream(&key).await?;
        Ok((key, upload))
    }

    /// Open a staged body for reading.
    pub async fn open_staged(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    /// Remove a staged body. Absent bodies are ignored.
    pub async fn remove_staged(&self, key: &str) -> StorageResult<()> {
        match self.inner.delete(key).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }
}
