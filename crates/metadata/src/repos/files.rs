//! File record repository.

use crate::error::MetadataResult;
use crate::models::FileRecord;
use async_trait::async_trait;

/// Repository for file records.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Persist a new file record.
    ///
    /// Fails with `AlreadyExists` if the code is taken by a file or a group.
    async fn insert_file(&self, record: &FileRecord) -> MetadataResult<()>;

    /// Look up a file by code.
    async fn get_file(&self, code: &str) -> MetadataResult<Option<FileRecord>>;

    /// Number of stored files.
    async fn count_files(&self) -> MetadataResult<usize>;
}
