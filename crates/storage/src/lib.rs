//! Object storage for courier.
//!
//! This crate provides:
//! - A filesystem object store with atomic writes and streaming uploads
//! - The artifact store holding completed uploads
//! - The chunk store holding in-progress chunked uploads, one prefix per session

pub mod backends;
pub mod chunks;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use chunks::ChunkStore;
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectStore, PrefixMeta, StreamingUpload};

use courier_core::config::StorageConfig;
use std::sync::Arc;

/// Storage handles built from configuration.
#[derive(Clone)]
pub struct Stores {
    /// Completed artifacts, keyed by stored name.
    pub artifacts: Arc<dyn ObjectStore>,
    /// Chunk scratch area.
    pub chunks: ChunkStore,
}

/// Create the artifact and chunk stores from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Stores> {
    config.validate().map_err(StorageError::Config)?;

    let artifacts: Arc<dyn ObjectStore> = Arc::new(FilesystemBackend::new(&config.files_path).await?);
    let scratch: Arc<dyn ObjectStore> = Arc::new(FilesystemBackend::new(&config.chunks_path).await?);

    Ok(Stores {
        artifacts,
        chunks: ChunkStore::new(scratch),
    })
}
