//! Streaming compression for stored artifacts.
//!
//! [`ArtifactWriter`] sits in front of a storage upload and, when asked to,
//! runs every byte through a gzip or zstd encoder on its way to disk. The
//! encoder instance lives across all writes, so chunk boundaries do not
//! reset the compression context. [`decode_stream`] is the matching read
//! side.

use async_compression::Level;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use bytes::Bytes;
use courier_core::config::CompressionConfig;
use courier_storage::{ByteStream, StreamingUpload};
use futures::{Stream, TryStreamExt};
use std::io;
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{ReaderStream, StreamReader};

/// Gzip compression level.
pub const GZIP_LEVEL: i32 = 6;

/// Zstd compression level.
pub const ZSTD_LEVEL: i32 = 3;

/// Encoded output is handed to storage once this much has accumulated.
const FLUSH_SIZE: usize = 1024 * 1024;

/// A boxed stream of decoded bytes.
pub type DecodedStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

enum Encoder {
    None,
    Gzip(GzipEncoder<Vec<u8>>),
    Zstd(ZstdEncoder<Vec<u8>>),
}

impl Encoder {
    fn new(compression: CompressionConfig) -> Self {
        match compression {
            CompressionConfig::None => Self::None,
            CompressionConfig::Gzip => {
                Self::Gzip(GzipEncoder::with_quality(Vec::new(), Level::Precise(GZIP_LEVEL)))
            }
            CompressionConfig::Zstd => {
                Self::Zstd(ZstdEncoder::with_quality(Vec::new(), Level::Precise(ZSTD_LEVEL)))
            }
        }
    }

    /// Encoded bytes produced so far, drained from the encoder.
    fn take_output(&mut self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Gzip(e) => std::mem::take(e.get_mut()),
            Self::Zstd(e) => std::mem::take(e.get_mut()),
        }
    }
}

/// Sizes of a finished artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenSizes {
    /// Bytes fed in.
    pub original: u64,
    /// Bytes that reached storage.
    pub stored: u64,
}

/// Writes an artifact to storage, optionally compressing on the way.
///
/// Dropping a writer without calling [`Self::finish`] drops the underlying
/// upload, which discards its partial data.
pub struct ArtifactWriter {
    upload: Box<dyn StreamingUpload>,
    encoder: Encoder,
    pending: Vec<u8>,
    original: u64,
}

impl ArtifactWriter {
    pub fn new(upload: Box<dyn StreamingUpload>, compression: CompressionConfig) -> Self {
        Self {
            upload,
            encoder: Encoder::new(compression),
            pending: Vec::new(),
            original: 0,
        }
    }

    /// Bytes fed in so far.
    pub fn original_size(&self) -> u64 {
        self.original
    }

    pub async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.original += data.len() as u64;
        match &mut self.encoder {
            Encoder::None => return self.send(data).await,
            Encoder::Gzip(e) => e.write_all(&data).await?,
            Encoder::Zstd(e) => e.write_all(&data).await?,
        }
        let out = self.encoder.take_output();
        self.pending.extend_from_slice(&out);
        if self.pending.len() >= FLUSH_SIZE {
            let buf = Bytes::from(std::mem::take(&mut self.pending));
            self.send(buf).await?;
        }
        Ok(())
    }

    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.upload
            .write(data)
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    /// Finalize the encoder and commit the artifact.
    pub async fn finish(mut self) -> io::Result<WrittenSizes> {
        match &mut self.encoder {
            Encoder::None => {}
            Encoder::Gzip(e) => e.shutdown().await?,
            Encoder::Zstd(e) => e.shutdown().await?,
        }
        let out = self.encoder.take_output();
        self.pending.extend_from_slice(&out);
        let rest = Bytes::from(std::mem::take(&mut self.pending));
        self.send(rest).await?;

        let stored = self
            .upload
            .finish()
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(WrittenSizes {
            original: self.original,
            stored,
        })
    }

    /// Discard the artifact.
    pub async fn abort(self) {
        if let Err(e) = self.upload.abort().await {
            tracing::warn!(error = %e, "Failed to abort artifact upload");
        }
    }
}

/// Wrap a stored byte stream with the decoder for `compression`.
pub fn decode_stream(stream: ByteStream, compression: CompressionConfig) -> DecodedStream {
    let reader = StreamReader::new(stream.map_err(|e| io::Error::other(e.to_string())));
    match compression {
        CompressionConfig::None => Box::pin(ReaderStream::new(reader)),
        CompressionConfig::Gzip => {
            let mut decoder = GzipDecoder::new(reader);
            decoder.multiple_members(true);
            Box::pin(ReaderStream::new(decoder))
        }
        CompressionConfig::Zstd => Box::pin(ReaderStream::new(ZstdDecoder::new(reader))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_storage::{FilesystemBackend, ObjectStore};
    use futures::StreamExt;

    async fn write_artifact(
        backend: &FilesystemBackend,
        key: &str,
        parts: &[&[u8]],
        compression: CompressionConfig,
    ) -> WrittenSizes {
        let upload = backend.put_stream(key).await.unwrap();
        let mut writer = ArtifactWriter::new(upload, compression);
        for part in parts {
            writer.write(Bytes::copy_from_slice(part)).await.unwrap();
        }
        writer.finish().await.unwrap()
    }

    async fn decode_all(backend: &FilesystemBackend, key: &str, c: CompressionConfig) -> Vec<u8> {
        let stream = backend.get_stream(key).await.unwrap();
        let parts: Vec<Bytes> = decode_stream(stream, c).try_collect().await.unwrap();
        parts.concat()
    }

    #[tokio::test]
    async fn test_compressed_artifact_decodes_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let part = "courier compresses repeated text very well. ".repeat(400);

        for c in [CompressionConfig::Gzip, CompressionConfig::Zstd] {
            let key = format!("artifact{}", c.extension());
            let sizes =
                write_artifact(&backend, &key, &[part.as_bytes(), part.as_bytes()], c).await;
            assert_eq!(sizes.original, (part.len() * 2) as u64);
            assert!(sizes.stored < sizes.original);
            assert_eq!(backend.get(&key).await.unwrap().len() as u64, sizes.stored);
            assert_eq!(
                decode_all(&backend, &key, c).await,
                [part.as_bytes(), part.as_bytes()].concat()
            );
        }
    }

    #[tokio::test]
    async fn test_uncompressed_artifact_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let sizes =
            write_artifact(&backend, "plain", &[b"CCCC", b"AAAA", b"BBBB"], CompressionConfig::None)
                .await;
        assert_eq!(sizes, WrittenSizes { original: 12, stored: 12 });
        assert_eq!(backend.get("plain").await.unwrap(), "CCCCAAAABBBB");
    }

    #[tokio::test]
    async fn test_random_data_does_not_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let mut noise = vec![0u8; 32 * 1024];
        rand::Rng::fill(&mut rand::rng(), &mut noise[..]);

        let sizes = write_artifact(&backend, "noise.gz", &[&noise], CompressionConfig::Gzip).await;
        assert!(sizes.stored >= sizes.original);
    }

    #[tokio::test]
    async fn test_aborted_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let upload = backend.put_stream("partial.gz").await.unwrap();
        let mut writer = ArtifactWriter::new(upload, CompressionConfig::Gzip);
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await;

        assert!(backend.get("partial.gz").await.unwrap_err().is_not_found());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_decoding_garbage_fails_on_first_block() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend
            .put("bogus.gz", Bytes::from_static(b"this is not gzip data"))
            .await
            .unwrap();

        let stream = backend.get_stream("bogus.gz").await.unwrap();
        let mut decoded = decode_stream(stream, CompressionConfig::Gzip);
        assert!(matches!(decoded.next().await, Some(Err(_))));
    }
}
