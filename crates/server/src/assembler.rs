//! Artifact assembly and commit.
//!
//! Both upload paths end here. A chunked session is assembled by streaming
//! its chunks in ascending index order into an [`ArtifactWriter`]; a
//! single-shot body is first staged to the scratch area and then streamed
//! the same way. Either path may compress. A compressed artifact that is not
//! smaller than its input is discarded and rebuilt uncompressed.

use crate::compression::{ArtifactWriter, WrittenSizes};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::registry::{SessionLease, SessionRegistry};
use bytes::Bytes;
use courier_core::UploadId;
use courier_core::config::CompressionConfig;
use courier_metadata::{FileRecord, MetadataStore};
use courier_storage::{ChunkStore, ObjectStore, StorageError, StreamingUpload};
use futures::{Stream, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage and compression policy for new artifacts.
#[derive(Clone, Debug)]
pub struct ArtifactPolicy {
    /// Algorithm used when a client asks for compression.
    pub compression: CompressionConfig,
    /// Uploads smaller than this are stored uncompressed.
    pub compression_threshold: u64,
    pub code_length: usize,
    /// Largest file accepted on either path.
    pub max_file_size: u64,
}

/// Where assembly reads its input from.
#[derive(Clone, Copy)]
enum Source<'a> {
    Chunks(&'a SessionLease),
    Staged(&'a str),
}

/// Why a pass over the input failed.
enum PumpError {
    MissingChunk(u32),
    Oversize(u64),
    Io(String),
}

impl From<PumpError> for ApiError {
    fn from(e: PumpError) -> Self {
        match e {
            PumpError::MissingChunk(index) => ApiError::MissingChunk(index),
            PumpError::Oversize(limit) => ApiError::OversizeFile { limit },
            PumpError::Io(msg) => ApiError::AssemblyFailed(msg),
        }
    }
}

/// Description of the file being stored.
struct ArtifactInput<'a> {
    filename: &'a str,
    content_type: &'a str,
    declared_size: u64,
    /// Bytes known to be waiting in the source.
    input_size: u64,
    compress_requested: bool,
    chunked: bool,
}

/// A single-shot body written to the scratch area.
///
/// Dropping a staged body that was never stored removes it in the
/// background.
pub struct StagedBody {
    key: String,
    size: u64,
    chunks: ChunkStore,
    armed: bool,
}

impl StagedBody {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Remove the staged bytes now.
    pub async fn discard(mut self) {
        self.armed = false;
        if let Err(e) = self.chunks.remove_staged(&self.key).await {
            warn!(key = %self.key, error = %e, "Failed to remove staged upload");
        }
    }
}

impl Drop for StagedBody {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let key = std::mem::take(&mut self.key);
        let chunks = self.chunks.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = chunks.remove_staged(&key).await {
                        warn!(key = %key, error = %e, "Failed to remove abandoned staged upload");
                    }
                });
            }
            Err(_) => warn!(key = %key, "Staged upload dropped outside a runtime, left on disk"),
        }
    }
}

/// Assembles uploads into stored artifacts and commits their records.
pub struct Assembler {
    registry: Arc<SessionRegistry>,
    chunks: ChunkStore,
    artifacts: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    policy: ArtifactPolicy,
}

impl Assembler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        chunks: ChunkStore,
        artifacts: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        policy: ArtifactPolicy,
    ) -> Self {
        Self {
            registry,
            chunks,
            artifacts,
            metadata,
            policy,
        }
    }

    /// Assemble a completed chunked session and commit it.
    ///
    /// Holds the session exclusively throughout. On success the session is
    /// evicted before it is released. On failure it stays live so the client
    /// can repair it (re-upload a missing chunk) and try again.
    pub async fn complete(
        &self,
        upload_id: &UploadId,
        compress_requested: bool,
    ) -> ApiResult<FileRecord> {
        let started = Instant::now();
        let lease = self.registry.lease(upload_id).await?;
        let params = lease.params().clone();

        let received = lease.received_count();
        if received != params.total_chunks {
            return Err(ApiError::IncompleteUpload {
                received,
                expected: params.total_chunks,
            });
        }

        let input = ArtifactInput {
            filename: &params.filename,
            content_type: &params.content_type,
            declared_size: params.total_size,
            input_size: lease.received_bytes(),
            compress_requested,
            chunked: true,
        };
        match self.store(Source::Chunks(&lease), &input).await {
            Ok(record) => {
                self.registry.finish(lease).await;
                metrics::FILES_STORED.with_label_values(&["chunked"]).inc();
                metrics::ASSEMBLY_DURATION.observe(started.elapsed().as_secs_f64());
                info!(
                    upload_id = %upload_id,
                    code = %record.code,
                    size = record.size,
                    original_size = record.original_size,
                    compressed = record.compressed,
                    "Chunked upload assembled"
                );
                Ok(record)
            }
            Err(ApiError::MissingChunk(index)) => {
                lease.forget_chunk(index);
                metrics::record_upload_error("missing_chunk");
                warn!(upload_id = %upload_id, index, "Chunk missing from storage during assembly");
                Err(ApiError::MissingChunk(index))
            }
            Err(e) => {
                metrics::record_upload_error(e.code());
                Err(e)
            }
        }
    }

    /// Stage a single-shot body into the scratch area.
    ///
    /// Fails with `OversizeFile` as soon as the body exceeds the size limit
    /// and with `InvalidParams` if it is empty. Nothing is left behind on
    /// failure.
    pub async fn stage<S>(&self, body: S) -> ApiResult<StagedBody>
    where
        S: Stream<Item = ApiResult<Bytes>>,
    {
        let (key, mut upload) = self.chunks.stage().await?;
        let body = std::pin::pin!(body);

        match self.copy_body(body, &mut *upload).await {
            Ok(0) => {
                abort_staging(&key, upload).await;
                Err(ApiError::InvalidParams("uploaded file is empty".to_string()))
            }
            Ok(size) => {
                upload.finish().await?;
                metrics::BYTES_RECEIVED.inc_by(size);
                debug!(key = %key, size, "Staged single-shot upload");
                Ok(StagedBody {
                    key,
                    size,
                    chunks: self.chunks.clone(),
                    armed: true,
                })
            }
            Err(e) => {
                abort_staging(&key, upload).await;
                Err(e)
            }
        }
    }

    async fn copy_body<S>(
        &self,
        mut body: std::pin::Pin<&mut S>,
        upload: &mut dyn StreamingUpload,
    ) -> ApiResult<u64>
    where
        S: Stream<Item = ApiResult<Bytes>>,
    {
        let limit = self.policy.max_file_size;
        while let Some(part) = body.next().await {
            let part = part?;
            if upload.bytes_written() + part.len() as u64 > limit {
                return Err(ApiError::OversizeFile { limit });
            }
            upload.write(part).await?;
        }
        Ok(upload.bytes_written())
    }

    /// Store a staged single-shot body and commit it.
    pub async fn store_whole(
        &self,
        staged: StagedBody,
        filename: &str,
        content_type: &str,
        compress_requested: bool,
    ) -> ApiResult<FileRecord> {
        let started = Instant::now();
        let input = ArtifactInput {
            filename,
            content_type,
            declared_size: staged.size,
            input_size: staged.size,
            compress_requested,
            chunked: false,
        };
        let result = self.store(Source::Staged(&staged.key), &input).await;
        staged.discard().await;

        match result {
            Ok(record) => {
                metrics::FILES_STORED.with_label_values(&["single"]).inc();
                metrics::ASSEMBLY_DURATION.observe(started.elapsed().as_secs_f64());
                info!(
                    code = %record.code,
                    size = record.size,
                    original_size = record.original_size,
                    compressed = record.compressed,
                    "Single-shot upload stored"
                );
                Ok(record)
            }
            Err(e) => {
                metrics::record_upload_error(e.code());
                Err(e)
            }
        }
    }

    /// Write the artifact (with compression fallback) and commit its record.
    async fn store(&self, source: Source<'_>, input: &ArtifactInput<'_>) -> ApiResult<FileRecord> {
        let compression = if input.compress_requested
            && input.input_size >= self.policy.compression_threshold
        {
            self.policy.compression
        } else {
            CompressionConfig::None
        };
        let base = stored_base(input.filename);

        let (stored_name, sizes, compressed) = match compression {
            CompressionConfig::None => {
                let (key, sizes) = self.write_artifact(source, &base, compression).await?;
                (key, sizes, false)
            }
            _ => match self.write_artifact(source, &base, compression).await {
                Ok((key, sizes)) if sizes.stored < sizes.original => (key, sizes, true),
                Ok((key, sizes)) => {
                    debug!(
                        original = sizes.original,
                        stored = sizes.stored,
                        "Compression did not shrink the artifact, storing uncompressed"
                    );
                    metrics::COMPRESSION_FALLBACKS.inc();
                    self.delete_artifact(&key).await;
                    let (key, sizes) = self
                        .write_artifact(source, &base, CompressionConfig::None)
                        .await?;
                    (key, sizes, false)
                }
                Err(e @ (PumpError::MissingChunk(_) | PumpError::Oversize(_))) => {
                    return Err(e.into());
                }
                Err(PumpError::Io(e)) => {
                    warn!(error = %e, "Compressed write failed, storing uncompressed");
                    metrics::COMPRESSION_FALLBACKS.inc();
                    let (key, sizes) = self
                        .write_artifact(source, &base, CompressionConfig::None)
                        .await?;
                    (key, sizes, false)
                }
            },
        };

        if sizes.original != input.declared_size {
            warn!(
                declared = input.declared_size,
                actual = sizes.original,
                "Assembled size differs from declared size"
            );
        }

        let now = OffsetDateTime::now_utc();
        let committed = courier_metadata::commit_file(
            self.metadata.as_ref(),
            self.policy.code_length,
            |code| FileRecord {
                code,
                filename: input.filename.to_string(),
                stored_name: stored_name.clone(),
                mime_type: if compressed {
                    compression.content_type().to_string()
                } else {
                    input.content_type.to_string()
                },
                original_mime_type: compressed.then(|| input.content_type.to_string()),
                original_size: sizes.original,
                size: sizes.stored,
                compressed,
                compression_ratio: compressed
                    .then(|| compression_ratio(sizes.original, sizes.stored)),
                created_at: now,
                chunked: input.chunked,
            },
        )
        .await;

        match committed {
            Ok(record) => Ok(record),
            Err(e) => {
                self.delete_artifact(&stored_name).await;
                Err(e.into())
            }
        }
    }

    async fn write_artifact(
        &self,
        source: Source<'_>,
        base: &str,
        compression: CompressionConfig,
    ) -> Result<(String, WrittenSizes), PumpError> {
        let key = format!("{base}{}", compression.extension());
        let upload = self
            .artifacts
            .put_stream(&key)
            .await
            .map_err(|e| PumpError::Io(e.to_string()))?;
        let mut writer = ArtifactWriter::new(upload, compression);

        if let Err(e) = self.pump(source, &mut writer).await {
            writer.abort().await;
            return Err(e);
        }
        let sizes = writer
            .finish()
            .await
            .map_err(|e| PumpError::Io(e.to_string()))?;
        Ok((key, sizes))
    }

    /// Feed the whole input into `writer`, chunks in ascending order.
    ///
    /// Stops with `Oversize` once the input passes `max_file_size`.
    async fn pump(&self, source: Source<'_>, writer: &mut ArtifactWriter) -> Result<(), PumpError> {
        let limit = self.policy.max_file_size;
        match source {
            Source::Chunks(lease) => {
                let upload_id = lease.upload_id();
                for index in 0..lease.params().total_chunks {
                    let stream = match self.chunks.open_chunk(upload_id, index).await {
                        Ok(s) => s,
                        Err(StorageError::NotFound(_)) => return Err(PumpError::MissingChunk(index)),
                        Err(e) => return Err(PumpError::Io(e.to_string())),
                    };
                    copy_stream(stream, writer, limit).await?;
                }
            }
            Source::Staged(key) => {
                let stream = self
                    .chunks
                    .open_staged(key)
                    .await
                    .map_err(|e| PumpError::Io(e.to_string()))?;
                copy_stream(stream, writer, limit).await?;
            }
        }
        Ok(())
    }

    async fn delete_artifact(&self, key: &str) {
        if let Err(e) = self.artifacts.delete(key).await
            && !e.is_not_found()
        {
            warn!(key, error = %e, "Failed to delete discarded artifact");
        }
    }
}

async fn copy_stream(
    mut stream: courier_storage::ByteStream,
    writer: &mut ArtifactWriter,
    limit: u64,
) -> Result<(), PumpError> {
    while let Some(part) = stream.next().await {
        let part = part.map_err(|e| PumpError::Io(e.to_string()))?;
        if writer.original_size() + part.len() as u64 > limit {
            return Err(PumpError::Oversize(limit));
        }
        writer
            .write(part)
            .await
            .map_err(|e| PumpError::Io(e.to_string()))?;
    }
    Ok(())
}

async fn abort_staging(key: &str, upload: Box<dyn StreamingUpload>) {
    if let Err(e) = upload.abort().await {
        warn!(key, error = %e, "Failed to abort staged upload");
    }
}

/// Random artifact name keeping a short, safe form of the original extension.
fn stored_base(filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 16 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{}{ext}", Uuid::new_v4())
}

/// Original size over stored size, rounded to two decimals.
fn compression_ratio(original: u64, stored: u64) -> f64 {
    if stored == 0 {
        return 0.0;
    }
    (original as f64 / stored as f64 * 100.0).round() / 100.0
}
