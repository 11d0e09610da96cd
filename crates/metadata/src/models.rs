//! Persisted record models.
//!
//! Field names are camelCase on disk so the record file stays readable by
//! the web client and by hand.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A stored file, addressed by its share code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub code: String,
    /// Filename as uploaded.
    pub filename: String,
    /// Artifact key in the file store.
    pub stored_name: String,
    /// Content-type of the stored artifact.
    pub mime_type: String,
    /// Declared content-type before compression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_mime_type: Option<String>,
    pub original_size: u64,
    /// Size of the stored artifact.
    pub size: u64,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Whether the file arrived through the chunked upload path.
    #[serde(default)]
    pub chunked: bool,
}

impl FileRecord {
    /// Content-type clients should see once the artifact is decoded.
    pub fn served_mime_type(&self) -> &str {
        match (&self.original_mime_type, self.compressed) {
            (Some(original), true) => original,
            _ => &self.mime_type,
        }
    }
}

/// A named, ordered collection of file codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub code: String,
    pub name: String,
    /// Member file codes in the order given at creation.
    pub files: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub file_count: usize,
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordSet {
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub groups: Vec<GroupRecord>,
}
