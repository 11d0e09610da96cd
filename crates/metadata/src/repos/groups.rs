//! Group record repository.

use crate::error::MetadataResult;
use crate::models::{FileRecord, GroupRecord};
use async_trait::async_trait;

/// Repository for group records.
#[async_trait]
pub trait GroupRepo: Send + Sync {
    /// Persist a new group record.
    ///
    /// Every member code must name an existing file; the first absent one is
    /// reported as `FileNotFound`. Returns the member records in group order.
    async fn insert_group(&self, record: &GroupRecord) -> MetadataResult<Vec<FileRecord>>;

    /// Look up a group by code.
    async fn get_group(&self, code: &str) -> MetadataResult<Option<GroupRecord>>;
}
