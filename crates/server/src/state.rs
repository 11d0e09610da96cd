//! Application state shared across handlers.

use crate::assembler::{ArtifactPolicy, Assembler};
use crate::clock::{Clock, SystemClock};
use crate::registry::{RegistryLimits, SessionRegistry};
use crate::retrieval::Retrieval;
use courier_core::config::AppConfig;
use courier_metadata::MetadataStore;
use courier_storage::Stores;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Live upload sessions.
    pub registry: Arc<SessionRegistry>,
    pub assembler: Arc<Assembler>,
    pub retrieval: Arc<Retrieval>,
    /// File and group records.
    pub metadata: Arc<dyn MetadataStore>,
    /// Artifact and chunk storage.
    pub stores: Stores,
}

impl AppState {
    /// Create new application state using the system clock.
    pub fn new(config: AppConfig, stores: Stores, metadata: Arc<dyn MetadataStore>) -> Self {
        Self::with_clock(config, stores, metadata, Arc::new(SystemClock))
    }

    /// Create new application state with an explicit clock.
    pub fn with_clock(
        config: AppConfig,
        stores: Stores,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            stores.chunks.clone(),
            clock,
            RegistryLimits {
                max_chunks_per_upload: config.uploads.max_chunks_per_upload,
                max_file_size: config.server.max_file_size,
                retention: config.uploads.retention(),
            },
        ));
        let assembler = Arc::new(Assembler::new(
            registry.clone(),
            stores.chunks.clone(),
            stores.artifacts.clone(),
            metadata.clone(),
            ArtifactPolicy {
                compression: config.uploads.compression,
                compression_threshold: config.uploads.compression_threshold,
                code_length: config.uploads.code_length,
                max_file_size: config.server.max_file_size,
            },
        ));
        let retrieval = Arc::new(Retrieval::new(
            stores.artifacts.clone(),
            metadata.clone(),
            config.uploads.best_effort_decompression,
        ));

        Self {
            config: Arc::new(config),
            registry,
            assembler,
            retrieval,
            metadata,
            stores,
        }
    }

    /// Spawn the background task that evicts abandoned sessions.
    ///
    /// Session directories left by a previous process are recorded first
    /// and removed once they age past the retention window.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let interval = self.config.uploads.sweep_interval();

        tokio::spawn(async move {
            registry.scan_orphans().await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = registry.sweep().await;
                if report.expired > 0 || report.orphans > 0 {
                    tracing::info!(
                        expired = report.expired,
                        orphans = report.orphans,
                        active = registry.active_count(),
                        "Upload sweep finished"
                    );
                } else {
                    tracing::debug!("Upload sweep found nothing to evict");
                }
            }
        })
    }
}
