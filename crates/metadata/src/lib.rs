//! Record store for courier.
//!
//! This crate provides:
//! - File and group record models
//! - Repository traits over those records
//! - A JSON document store with atomic saves
//! - Share code allocation against the shared code namespace

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{FileRecord, GroupRecord, RecordSet};
pub use repos::{FileRepo, GroupRepo};
pub use store::{JsonStore, MetadataStore};

use courier_core::config::MetadataConfig;
use courier_core::random_code;
use std::sync::Arc;
use time::OffsetDateTime;

/// Number of fresh codes drawn before giving up.
pub const CODE_GENERATION_ATTEMPTS: usize = 16;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let store = JsonStore::open(&config.path).await?;
    Ok(Arc::new(store) as Arc<dyn MetadataStore>)
}

/// Draw a code that no file or group currently uses.
pub async fn generate_unique_code(
    store: &dyn MetadataStore,
    len: usize,
) -> MetadataResult<String> {
    for attempt in 1..=CODE_GENERATION_ATTEMPTS {
        let code = random_code(len);
        if !store.code_exists(&code).await? {
            return Ok(code);
        }
        tracing::debug!(attempt, "Generated code already in use, retrying");
    }
    Err(MetadataError::CodeSpaceExhausted {
        attempts: CODE_GENERATION_ATTEMPTS,
    })
}

/// Commit a file record under a freshly allocated code.
///
/// `build` receives the code and returns the record to store. A collision
/// with a concurrent commit is retried with a new code.
pub async fn commit_file<F>(
    store: &dyn MetadataStore,
    code_len: usize,
    build: F,
) -> MetadataResult<FileRecord>
where
    F: Fn(String) -> FileRecord,
{
    for _ in 0..CODE_GENERATION_ATTEMPTS {
        let record = build(generate_unique_code(store, code_len).await?);
        match store.insert_file(&record).await {
            Ok(()) => return Ok(record),
            Err(MetadataError::AlreadyExists(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(MetadataError::CodeSpaceExhausted {
        attempts: CODE_GENERATION_ATTEMPTS,
    })
}

/// Display name given to groups created without one.
pub fn default_group_name(file_count: usize) -> String {
    format!("Group of {file_count} files")
}

/// Create a group over existing file codes.
///
/// Returns the stored group and its member records in order.
pub async fn create_group(
    store: &dyn MetadataStore,
    code_len: usize,
    file_codes: Vec<String>,
    name: Option<String>,
) -> MetadataResult<(GroupRecord, Vec<FileRecord>)> {
    if file_codes.is_empty() {
        return Err(MetadataError::InvalidParams(
            "fileIds must contain at least one code".to_string(),
        ));
    }

    let name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_group_name(file_codes.len()));

    for _ in 0..CODE_GENERATION_ATTEMPTS {
        let record = GroupRecord {
            code: generate_unique_code(store, code_len).await?,
            name: name.clone(),
            file_count: file_codes.len(),
            files: file_codes.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        match store.insert_group(&record).await {
            Ok(members) => return Ok((record, members)),
            Err(MetadataError::AlreadyExists(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(MetadataError::CodeSpaceExhausted {
        attempts: CODE_GENERATION_ATTEMPTS,
    })
}
