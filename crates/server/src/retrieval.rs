//! Code resolution and artifact streaming.

use crate::compression::{DecodedStream, decode_stream};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use courier_core::ShareCode;
use courier_core::config::CompressionConfig;
use courier_metadata::{FileRecord, FileRepo, GroupRecord, GroupRepo, MetadataStore};
use courier_storage::{ByteStream, ObjectStore, StorageError};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a share code refers to.
#[derive(Debug, Clone)]
pub enum Resolved {
    File(FileRecord),
    Group(GroupRecord),
}

/// A file ready to be streamed to a client.
pub struct Download {
    pub record: FileRecord,
    /// Content-type of the bytes in `body`.
    pub content_type: String,
    /// Exact length of `body`.
    pub content_length: u64,
    pub body: DecodedStream,
}

/// Resolves codes and opens artifacts for download.
pub struct Retrieval {
    artifacts: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    best_effort: bool,
}

impl Retrieval {
    /// `best_effort` serves raw stored bytes when a compressed artifact
    /// cannot be decoded; otherwise the download fails.
    pub fn new(
        artifacts: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        best_effort: bool,
    ) -> Self {
        Self {
            artifacts,
            metadata,
            best_effort,
        }
    }

    /// Look a code up as a file, then as a group.
    ///
    /// Malformed codes are reported as not found.
    pub async fn resolve(&self, code: &str) -> ApiResult<Resolved> {
        let Ok(code) = ShareCode::parse(code) else {
            return Err(ApiError::NotFound(format!("no file or group for code {code:?}")));
        };
        if let Some(file) = self.metadata.get_file(code.as_str()).await? {
            return Ok(Resolved::File(file));
        }
        if let Some(group) = self.metadata.get_group(code.as_str()).await? {
            return Ok(Resolved::Group(group));
        }
        Err(ApiError::NotFound(format!("no file or group for code {code}")))
    }

    /// Resolve a code to a single file and open its bytes.
    ///
    /// Group codes fail with `IsGroup`. Compressed artifacts are decoded
    /// on the fly; the first block is decoded up front so a corrupt
    /// artifact is detected before any response is sent.
    pub async fn resolve_and_stream(&self, code: &str) -> ApiResult<Download> {
        let record = match self.resolve(code).await? {
            Resolved::File(file) => file,
            Resolved::Group(group) => {
                return Err(ApiError::IsGroup {
                    code: group.code,
                    file_count: group.file_count,
                });
            }
        };

        let raw = self.open_artifact(&record).await?;
        let compression = if record.compressed {
            artifact_compression(&record)
        } else {
            None
        };
        let Some(compression) = compression else {
            if record.compressed {
                warn!(code = %record.code, mime_type = %record.mime_type, "Unknown compression, serving stored bytes");
            }
            metrics::DOWNLOADS.with_label_values(&["identity"]).inc();
            return Ok(raw_download(record, raw));
        };

        let mut decoded = decode_stream(raw, compression);
        match decoded.next().await {
            Some(Ok(first)) => {
                metrics::DOWNLOADS.with_label_values(&["decoded"]).inc();
                let code = record.code.clone();
                let body: DecodedStream = Box::pin(
                    futures::stream::once(async { Ok(first) })
                        .chain(decoded)
                        .inspect_err(move |e| {
                            metrics::DECOMPRESSION_FAILURES.inc();
                            warn!(code = %code, error = %e, "Decompression failed mid-stream, aborting response");
                        }),
                );
                Ok(Download {
                    content_type: record.served_mime_type().to_string(),
                    content_length: record.original_size,
                    record,
                    body,
                })
            }
            None => {
                metrics::DOWNLOADS.with_label_values(&["decoded"]).inc();
                Ok(Download {
                    content_type: record.served_mime_type().to_string(),
                    content_length: 0,
                    record,
                    body: Box::pin(futures::stream::empty()),
                })
            }
            Some(Err(e)) => {
                metrics::DECOMPRESSION_FAILURES.inc();
                if !self.best_effort {
                    return Err(ApiError::DecompressionFailed(format!(
                        "{}: {e}",
                        record.code
                    )));
                }
                warn!(code = %record.code, error = %e, "Failed to decompress artifact, serving stored bytes");
                let raw = self.open_artifact(&record).await?;
                metrics::DOWNLOADS.with_label_values(&["raw_fallback"]).inc();
                Ok(raw_download(record, raw))
            }
        }
    }

    async fn open_artifact(&self, record: &FileRecord) -> ApiResult<ByteStream> {
        match self.artifacts.get_stream(&record.stored_name).await {
            Ok(stream) => Ok(stream),
            Err(StorageError::NotFound(_)) => {
                warn!(code = %record.code, stored_name = %record.stored_name, "Artifact missing for committed record");
                Err(ApiError::ArtifactMissing(record.code.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Compression of a stored artifact, from its recorded type or its name.
fn artifact_compression(record: &FileRecord) -> Option<CompressionConfig> {
    CompressionConfig::from_content_type(&record.mime_type).or_else(|| {
        [CompressionConfig::Gzip, CompressionConfig::Zstd]
            .into_iter()
            .find(|c| record.stored_name.ends_with(c.extension()))
    })
}

fn raw_download(record: FileRecord, raw: ByteStream) -> Download {
    debug!(code = %record.code, size = record.size, "Serving stored bytes");
    Download {
        content_type: record.mime_type.clone(),
        content_length: record.size,
        record,
        body: Box::pin(raw.map_err(|e| std::io::Error::other(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_metadata::JsonStore;
    use courier_storage::FilesystemBackend;
    use time::OffsetDateTime;

    async fn setup(best_effort: bool) -> (tempfile::TempDir, Arc<dyn ObjectStore>, Arc<dyn MetadataStore>, Retrieval) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(dir.path().join("files")).await.unwrap());
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(JsonStore::open(dir.path().join("metadata.json")).await.unwrap());
        let retrieval = Retrieval::new(artifacts.clone(), metadata.clone(), best_effort);
        (dir, artifacts, metadata, retrieval)
    }

    fn record(code: &str, stored_name: &str, compressed: bool, size: u64) -> FileRecord {
        FileRecord {
            code: code.to_string(),
            filename: "notes.txt".to_string(),
            stored_name: stored_name.to_string(),
            mime_type: if compressed { "application/gzip" } else { "text/plain" }.to_string(),
            original_mime_type: compressed.then(|| "text/plain".to_string()),
            original_size: 5,
            size,
            compressed,
            compression_ratio: None,
            created_at: OffsetDateTime::now_utc(),
            chunked: false,
        }
    }

    async fn collect(body: DecodedStream) -> Vec<u8> {
        let parts: Vec<Bytes> = body.try_collect().await.unwrap();
        parts.concat()
    }

    #[tokio::test]
    async fn test_plain_file_streams_stored_bytes() {
        let (_dir, artifacts, metadata, retrieval) = setup(true).await;
        artifacts.put("a.txt", Bytes::from_static(b"hello")).await.unwrap();
        metadata.insert_file(&record("PLAN23", "a.txt", false, 5)).await.unwrap();

        let download = retrieval.resolve_and_stream("plan23").await.unwrap();
        assert_eq!(download.content_type, "text/plain");
        assert_eq!(download.content_length, 5);
        assert_eq!(collect(download.body).await, b"hello");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_codes_not_found() {
        let (_dir, _artifacts, _metadata, retrieval) = setup(true).await;
        assert!(matches!(
            retrieval.resolve_and_stream("ZZZZZZ").await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            retrieval.resolve_and_stream("../etc").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_group_code_reports_is_group() {
        let (_dir, artifacts, metadata, retrieval) = setup(true).await;
        artifacts.put("a.txt", Bytes::from_static(b"hello")).await.unwrap();
        metadata.insert_file(&record("MEMBER", "a.txt", false, 5)).await.unwrap();
        metadata
            .insert_group(&GroupRecord {
                code: "GRP234".to_string(),
                name: "docs".to_string(),
                files: vec!["MEMBER".to_string()],
                created_at: OffsetDateTime::now_utc(),
                file_count: 1,
            })
            .await
            .unwrap();

        match retrieval.resolve_and_stream("GRP234").await {
            Err(ApiError::IsGroup { file_count, .. }) => assert_eq!(file_count, 1),
            other => panic!("expected IsGroup, got {:?}", other.map(|d| d.record)),
        }
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let (_dir, _artifacts, metadata, retrieval) = setup(true).await;
        metadata.insert_file(&record("GHST23", "gone.txt", false, 5)).await.unwrap();
        assert!(matches!(
            retrieval.resolve_and_stream("GHST23").await,
            Err(ApiError::ArtifactMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_best_effort_serves_raw() {
        let (_dir, artifacts, metadata, retrieval) = setup(true).await;
        artifacts.put("bad.txt.gz", Bytes::from_static(b"not gzip")).await.unwrap();
        metadata.insert_file(&record("BRKEN2", "bad.txt.gz", true, 8)).await.unwrap();

        let download = retrieval.resolve_and_stream("BRKEN2").await.unwrap();
        assert_eq!(download.content_type, "application/gzip");
        assert_eq!(download.content_length, 8);
        assert_eq!(collect(download.body).await, b"not gzip");
    }

    #[tokio::test]
    async fn test_corrupt_artifact_strict_fails() {
        let (_dir, artifacts, metadata, retrieval) = setup(false).await;
        artifacts.put("bad.txt.gz", Bytes::from_static(b"not gzip")).await.unwrap();
        metadata.insert_file(&record("BRKEN2", "bad.txt.gz", true, 8)).await.unwrap();

        assert!(matches!(
            retrieval.resolve_and_stream("BRKEN2").await,
            Err(ApiError::DecompressionFailed(_))
        ));
    }
}
