//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectStore, PrefixMeta, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Marker embedded in temp file names. Temp files are never listed as prefixes.
const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path, with path traversal protection.
    ///
    /// Runs the checks on the blocking pool since they stat and canonicalize.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Returns an error if the key would escape the storage root, including
    /// through symlinks at the key itself or at any existing ancestor.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key:?}"
            )));
        }
        if !Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Existing paths (including broken symlinks) must resolve inside the root.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("symlink target missing or invalid: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }

        // New paths: the nearest existing ancestor must resolve inside the root,
        // otherwise create_dir_all would follow a symlinked directory out of it.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
            ancestor = parent;
        }

        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Sibling temp path for an atomic write to `path`.
    fn temp_path_for(path: &Path) -> PathBuf {
        let suffix = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{suffix}", n.to_string_lossy()))
                .unwrap_or(suffix),
        )
    }
}

fn map_not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(map_not_found(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path).await.map_err(map_not_found(key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        // Temp file + fsync + rename, so concurrent writers of the same key
        // never interleave and readers never see a partial object.
        let temp_path = Self::temp_path_for(&path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = Self::temp_path_for(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file: Some(file),
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(map_not_found(key))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_prefix(&self, prefix: &str) -> StorageResult<()> {
        let path = self.key_path(prefix).await?;
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<()> {
        let path = self.key_path(prefix).await?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_prefixes(&self) -> StorageResult<Vec<PrefixMeta>> {
        let mut results = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            // file_type() does not follow symlinks; linked directories are skipped.
            let file_type = entry.file_type().await?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(TEMP_MARKER) {
                continue;
            }
            let last_modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(Into::into);
            results.push(PrefixMeta {
                name,
                last_modified,
            });
        }
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
///
/// Writes go to a sibling temp file that is renamed into place on `finish`.
/// Dropping an unfinished upload removes the temp file.
struct FilesystemUpload {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

impl FilesystemUpload {
    fn file(&mut self) -> StorageResult<&mut fs::File> {
        self.file.as_mut().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("streaming upload already closed"))
        })
    }
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file()?.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        let result = async {
            let file = self.file()?;
            file.flush().await?;
            file.sync_all().await?;
            self.file = None;
            fs::rename(&self.temp_path, &self.final_path).await?;
            Ok::<_, StorageError>(())
        }
        .await;

        match result {
            Ok(()) => {
                // Renamed; nothing left for Drop to clean up.
                self.temp_path = PathBuf::new();
                Ok(self.bytes_written)
            }
            Err(e) => {
                self.file = None;
                let _ = fs::remove_file(&self.temp_path).await;
                self.temp_path = PathBuf::new();
                Err(e)
            }
        }
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.file = None;
        let _ = fs::remove_file(&self.temp_path).await;
        self.temp_path = PathBuf::new();
        Ok(())
    }
}

impl Drop for FilesystemUpload {
    fn drop(&mut self) {
        if self.temp_path.as_os_str().is_empty() {
            return;
        }
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.temp_path)
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!(
                path = %self.temp_path.display(),
                error = %e,
                "Failed to remove abandoned upload temp file"
            );
        } else {
            tracing::debug!(
                path = %self.temp_path.display(),
                "Removed abandoned upload temp file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        (dir, backend)
    }

    fn dir_entries(path: &Path) -> Vec<String> {
        std::fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, backend) = backend().await;

        let key = "test/object";
        let data = Bytes::from("hello world");

        backend.put(key, data.clone()).await.unwrap();
        assert_eq!(backend.get(key).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_get_stream_reads_everything() {
        let (_dir, backend) = backend().await;
        let data = Bytes::from(vec![7u8; STREAM_CHUNK_SIZE * 2 + 5]);
        backend.put("big", data.clone()).await.unwrap();

        let parts: Vec<Bytes> = backend
            .get_stream("big")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.concat(), data.to_vec());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_dir, backend) = backend().await;
        assert!(backend.get("nope").await.unwrap_err().is_not_found());
        assert!(matches!(
            backend.get_stream("nope").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(backend.delete("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_streaming_upload_visible_only_after_finish() {
        let (dir, backend) = backend().await;

        let mut upload = backend.put_stream("streamed").await.unwrap();
        upload.write(Bytes::from_static(b"abc")).await.unwrap();
        upload.write(Bytes::from_static(b"def")).await.unwrap();
        assert_eq!(upload.bytes_written(), 6);
        assert!(backend.get("streamed").await.unwrap_err().is_not_found());

        assert_eq!(upload.finish().await.unwrap(), 6);
        assert_eq!(backend.get("streamed").await.unwrap(), "abcdef");
        assert_eq!(dir_entries(dir.path()), vec!["streamed".to_string()]);
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_nothing() {
        let (dir, backend) = backend().await;

        let mut upload = backend.put_stream("aborted").await.unwrap();
        upload.write(Bytes::from_static(b"partial")).await.unwrap();
        upload.abort().await.unwrap();

        assert!(backend.get("aborted").await.unwrap_err().is_not_found());
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_upload_leaves_nothing() {
        let (dir, backend) = backend().await;

        {
            let mut upload = backend.put_stream("dropped").await.unwrap();
            upload.write(Bytes::from_static(b"partial")).await.unwrap();
        }

        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_prefix_lifecycle() {
        let (_dir, backend) = backend().await;

        backend.create_prefix("session-a").await.unwrap();
        backend.create_prefix("session-a").await.unwrap();
        backend.put("session-b/0", Bytes::from_static(b"x")).await.unwrap();
        backend.put("loose-file", Bytes::from_static(b"x")).await.unwrap();

        let mut names: Vec<String> = backend
            .list_prefixes()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["session-a", "session-b"]);

        backend.delete_prefix("session-b").await.unwrap();
        assert!(backend.get("session-b/0").await.unwrap_err().is_not_found());
        // Deleting an absent prefix is not an error.
        backend.delete_prefix("session-b").await.unwrap();
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, backend) = backend().await;

        for key in ["../escape", "/absolute/path", "foo/../bar", ""] {
            assert!(matches!(
                backend.get(key).await,
                Err(StorageError::InvalidKey(_))
            ));
        }
        assert!(backend.delete_prefix("..").await.is_err());

        assert!(backend.get("valid/nested/key").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_traversal_rejected() {
        use std::os::unix::fs::symlink;

        let (dir, backend) = backend().await;
        let outside_dir = tempfile::tempdir().unwrap();
        let outside_file = outside_dir.path().join("secret.txt");
        std::fs::write(&outside_file, "secret data").unwrap();

        symlink(&outside_file, dir.path().join("malicious_link")).unwrap();
        match backend.get("malicious_link").await {
            Err(StorageError::InvalidKey(msg)) => assert!(msg.contains("escapes storage root")),
            other => panic!("expected InvalidKey error, got: {other:?}"),
        }

        symlink(outside_dir.path(), dir.path().join("escape")).unwrap();
        let result = backend
            .put("escape/nested/file.txt", Bytes::from("data"))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(!outside_dir.path().join("nested").exists());

        // Symlinked directories are not reported as prefixes.
        assert!(backend.list_prefixes().await.unwrap().is_empty());
    }
}
