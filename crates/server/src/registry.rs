//! Upload session registry.
//!
//! The registry owns every live upload session. Locking discipline:
//!
//! - The session table is a `std::sync::Mutex`, held only for map operations.
//! - Each session has an async `RwLock` gate. Chunk writes hold it shared, so
//!   distinct indices are written in parallel. Assembly and eviction hold it
//!   exclusively, so a session is never assembled twice or evicted mid-write.
//! - Each session has a `std::sync::Mutex` over its progress (received set,
//!   in-flight set, byte count, evicted flag) for check-then-act on chunk
//!   indices.
//!
//! An evicted session stays evicted: anything that looked it up before the
//! eviction observes the flag once it gets the gate and reports the session
//! as unknown.

use crate::clock::Clock;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use bytes::Bytes;
use courier_core::{SessionParams, UploadId};
use courier_storage::{ChunkStore, PrefixMeta};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use time::{Duration, OffsetDateTime};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

/// Limits applied when sessions are opened and swept.
#[derive(Clone, Debug)]
pub struct RegistryLimits {
    pub max_chunks_per_upload: u32,
    pub max_file_size: u64,
    /// Age after which an unfinished session is evicted.
    pub retention: Duration,
}

#[derive(Default)]
struct Progress {
    received: BTreeSet<u32>,
    in_flight: HashSet<u32>,
    /// Size of every received or in-flight chunk.
    sizes: HashMap<u32, u64>,
    /// Sum of `sizes`.
    bytes: u64,
    evicted: bool,
}

impl Progress {
    fn reserve(&mut self, index: u32, size: u64) {
        self.in_flight.insert(index);
        self.sizes.insert(index, size);
        self.bytes += size;
    }

    fn release(&mut self, index: u32) {
        if let Some(size) = self.sizes.remove(&index) {
            self.bytes -= size;
        }
    }
}

struct SessionSlot {
    id: UploadId,
    params: SessionParams,
    created_at: OffsetDateTime,
    gate: Arc<RwLock<()>>,
    progress: Mutex<Progress>,
}

impl SessionSlot {
    fn new(id: UploadId, params: SessionParams, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            params,
            created_at,
            gate: Arc::new(RwLock::new(())),
            progress: Mutex::new(Progress::default()),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn received_count(&self) -> u32 {
        self.progress().received.len() as u32
    }
}

/// Result of opening or resuming a session.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub upload_id: UploadId,
    pub received_chunks: u32,
    pub total_chunks: u32,
    /// Whether an existing session with identical parameters was resumed.
    pub resumed: bool,
}

/// Result of a chunk upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub received_chunks: u32,
    pub total_chunks: u32,
    /// The index was already received or being written; nothing was stored.
    pub duplicate: bool,
}

/// Snapshot of a session's progress.
#[derive(Debug, Clone)]
pub struct SessionProgress {
    pub upload_id: UploadId,
    pub received_chunks: u32,
    pub total_chunks: u32,
    /// Indices not yet received, ascending.
    pub missing: Vec<u32>,
}

/// What a sweep pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub orphans: usize,
}

/// Exclusive hold on a session for assembly.
///
/// While a lease is alive no chunk can be written to the session and no one
/// else can assemble or evict it. Dropping the lease without calling
/// [`SessionRegistry::finish`] leaves the session live.
pub struct SessionLease {
    slot: Arc<SessionSlot>,
    _gate: OwnedRwLockWriteGuard<()>,
}

impl SessionLease {
    pub fn upload_id(&self) -> &UploadId {
        &self.slot.id
    }

    pub fn params(&self) -> &SessionParams {
        &self.slot.params
    }

    pub fn received_count(&self) -> u32 {
        self.slot.received_count()
    }

    /// Bytes accepted across all received chunks.
    pub fn received_bytes(&self) -> u64 {
        self.slot.progress().bytes
    }

    /// Forget a received chunk so the client can upload it again.
    pub fn forget_chunk(&self, index: u32) {
        let mut progress = self.slot.progress();
        if progress.received.remove(&index) {
            progress.release(index);
        }
    }
}

/// Marks a chunk index as being written. Dropping the claim without
/// committing releases the index.
struct InFlightClaim<'a> {
    slot: &'a SessionSlot,
    index: u32,
    committed: bool,
}

impl InFlightClaim<'_> {
    fn commit(mut self) -> u32 {
        let mut progress = self.slot.progress();
        progress.in_flight.remove(&self.index);
        progress.received.insert(self.index);
        self.committed = true;
        progress.received.len() as u32
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut progress = self.slot.progress();
            progress.in_flight.remove(&self.index);
            progress.release(self.index);
        }
    }
}

/// Registry of live upload sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<UploadId, Arc<SessionSlot>>>,
    /// Session directories found on disk at startup with no live session.
    orphans: Mutex<Vec<PrefixMeta>>,
    chunks: ChunkStore,
    clock: Arc<dyn Clock>,
    limits: RegistryLimits,
}

impl SessionRegistry {
    pub fn new(chunks: ChunkStore, clock: Arc<dyn Clock>, limits: RegistryLimits) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
            chunks,
            clock,
            limits,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<UploadId, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, upload_id: &UploadId) -> Option<Arc<SessionSlot>> {
        self.sessions().get(upload_id).cloned()
    }

    fn unknown(upload_id: &UploadId) -> ApiError {
        ApiError::UnknownSession(upload_id.to_string())
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Open a session, or resume one with identical parameters.
    ///
    /// A live session under the same id with different parameters is
    /// evicted and replaced.
    pub async fn init(
        &self,
        upload_id: Option<UploadId>,
        params: SessionParams,
    ) -> ApiResult<InitOutcome> {
        params.validate()?;
        if params.total_chunks > self.limits.max_chunks_per_upload {
            return Err(ApiError::InvalidParams(format!(
                "totalChunks {} exceeds the maximum of {}",
                params.total_chunks, self.limits.max_chunks_per_upload
            )));
        }
        if params.total_size > self.limits.max_file_size {
            return Err(ApiError::OversizeFile {
                limit: self.limits.max_file_size,
            });
        }

        let upload_id = upload_id.unwrap_or_default();

        if let Some(existing) = self.get(&upload_id) {
            if existing.params == params && !existing.progress().evicted {
                return Ok(Self::resumed(&existing));
            }
            info!(
                upload_id = %upload_id,
                "Session re-initialized with different parameters, discarding previous state"
            );
            self.evict_slot(&existing, "reinit").await;
        }

        self.chunks.create_session(&upload_id).await?;
        let slot = Arc::new(SessionSlot::new(
            upload_id.clone(),
            params.clone(),
            self.clock.now(),
        ));

        let raced = {
            let mut sessions = self.sessions();
            let raced = match sessions.entry(upload_id.clone()) {
                Entry::Occupied(entry) => Some(entry.get().clone()),
                Entry::Vacant(entry) => {
                    entry.insert(slot);
                    None
                }
            };
            metrics::ACTIVE_UPLOAD_SESSIONS.set(sessions.len() as i64);
            raced
        };

        if let Some(other) = raced {
            // Lost a race with a concurrent init for the same id.
            if other.params == params {
                return Ok(Self::resumed(&other));
            }
            return Err(ApiError::InvalidParams(format!(
                "upload id {upload_id} is being initialized concurrently"
            )));
        }

        self.orphans_mut().retain(|o| o.name != upload_id.as_str());
        metrics::UPLOAD_SESSIONS_CREATED.inc();
        info!(
            upload_id = %upload_id,
            filename = %params.filename,
            total_chunks = params.total_chunks,
            total_size = params.total_size,
            "Upload session created"
        );
        Ok(InitOutcome {
            upload_id,
            received_chunks: 0,
            total_chunks: params.total_chunks,
            resumed: false,
        })
    }

    fn resumed(slot: &SessionSlot) -> InitOutcome {
        metrics::UPLOAD_SESSIONS_RESUMED.inc();
        let received_chunks = slot.received_count();
        debug!(upload_id = %slot.id, received_chunks, "Upload session resumed");
        InitOutcome {
            upload_id: slot.id.clone(),
            received_chunks,
            total_chunks: slot.params.total_chunks,
            resumed: true,
        }
    }

    /// Store one chunk of a session.
    ///
    /// An index that is already received, or currently being written by
    /// another request, is reported as a duplicate and not stored again.
    /// A chunk that would take the session past `max_file_size` is rejected
    /// with `OversizeFile`, whatever size was declared at init.
    pub async fn accept_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
        data: Bytes,
    ) -> ApiResult<ChunkOutcome> {
        let slot = self.get(upload_id).ok_or_else(|| Self::unknown(upload_id))?;
        let total_chunks = slot.params.total_chunks;
        if index >= total_chunks {
            return Err(ApiError::InvalidParams(format!(
                "chunkIndex {index} is out of range for {total_chunks} chunks"
            )));
        }

        let _shared = slot.gate.read().await;
        {
            let mut progress = slot.progress();
            if progress.evicted {
                return Err(Self::unknown(upload_id));
            }
            if progress.received.contains(&index) || progress.in_flight.contains(&index) {
                metrics::CHUNKS_DUPLICATE.inc();
                debug!(upload_id = %upload_id, index, "Duplicate chunk discarded");
                return Ok(ChunkOutcome {
                    received_chunks: progress.received.len() as u32,
                    total_chunks,
                    duplicate: true,
                });
            }
            if data.is_empty() {
                return Err(ApiError::EmptyChunk(index));
            }
            let limit = self.limits.max_file_size;
            if progress.bytes + data.len() as u64 > limit {
                warn!(
                    upload_id = %upload_id,
                    index,
                    received_bytes = progress.bytes,
                    declared = slot.params.total_size,
                    "Chunk would exceed the file size limit"
                );
                return Err(ApiError::OversizeFile { limit });
            }
            progress.reserve(index, data.len() as u64);
        }

        let claim = InFlightClaim {
            slot: slot.as_ref(),
            index,
            committed: false,
        };
        let size = data.len() as u64;
        self.chunks.write_chunk(upload_id, index, data).await?;
        let received_chunks = claim.commit();

        metrics::CHUNKS_RECEIVED.inc();
        metrics::BYTES_RECEIVED.inc_by(size);
        Ok(ChunkOutcome {
            received_chunks,
            total_chunks,
            duplicate: false,
        })
    }

    /// Whether every chunk of a session has been received.
    pub fn is_complete(&self, upload_id: &UploadId) -> ApiResult<bool> {
        let slot = self.get(upload_id).ok_or_else(|| Self::unknown(upload_id))?;
        Ok(slot.received_count() == slot.params.total_chunks)
    }

    /// Snapshot the progress of a session.
    pub fn progress(&self, upload_id: &UploadId) -> ApiResult<SessionProgress> {
        let slot = self.get(upload_id).ok_or_else(|| Self::unknown(upload_id))?;
        let progress = slot.progress();
        if progress.evicted {
            return Err(Self::unknown(upload_id));
        }
        let total_chunks = slot.params.total_chunks;
        Ok(SessionProgress {
            upload_id: slot.id.clone(),
            received_chunks: progress.received.len() as u32,
            total_chunks,
            missing: (0..total_chunks)
                .filter(|i| !progress.received.contains(i))
                .collect(),
        })
    }

    /// Take exclusive hold of a session for assembly.
    ///
    /// Waits for in-progress chunk writes. A session evicted while waiting
    /// (for example by a concurrent completion) is reported as unknown.
    pub async fn lease(&self, upload_id: &UploadId) -> ApiResult<SessionLease> {
        let slot = self.get(upload_id).ok_or_else(|| Self::unknown(upload_id))?;
        let gate = slot.gate.clone().write_owned().await;
        if slot.progress().evicted {
            return Err(Self::unknown(upload_id));
        }
        Ok(SessionLease { slot, _gate: gate })
    }

    /// Evict a session whose assembly has been committed, then release it.
    pub async fn finish(&self, lease: SessionLease) {
        self.evict_locked(&lease.slot, "completed").await;
    }

    /// Remove a session and its chunk storage. Unknown ids are ignored.
    pub async fn evict(&self, upload_id: &UploadId) {
        if let Some(slot) = self.get(upload_id) {
            self.evict_slot(&slot, "explicit").await;
        }
    }

    async fn evict_slot(&self, slot: &Arc<SessionSlot>, reason: &'static str) {
        let _gate = slot.gate.write().await;
        self.evict_locked(slot, reason).await;
    }

    /// Evict with the session gate already held exclusively.
    async fn evict_locked(&self, slot: &Arc<SessionSlot>, reason: &'static str) {
        let first = {
            let mut progress = slot.progress();
            !std::mem::replace(&mut progress.evicted, true)
        };
        if first {
            if let Err(e) = self.chunks.remove_session(&slot.id).await {
                warn!(upload_id = %slot.id, error = %e, "Failed to remove session chunks");
            }
            metrics::UPLOAD_SESSIONS_EVICTED
                .with_label_values(&[reason])
                .inc();
            debug!(upload_id = %slot.id, reason, "Upload session evicted");
        }

        let mut sessions = self.sessions();
        if let Entry::Occupied(entry) = sessions.entry(slot.id.clone())
            && Arc::ptr_eq(entry.get(), slot)
        {
            entry.remove();
        }
        metrics::ACTIVE_UPLOAD_SESSIONS.set(sessions.len() as i64);
    }

    fn orphans_mut(&self) -> MutexGuard<'_, Vec<PrefixMeta>> {
        self.orphans.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record session directories left on disk by a previous process.
    ///
    /// They are removed by [`Self::sweep`] once older than the retention
    /// window. Returns how many were found.
    pub async fn scan_orphans(&self) -> usize {
        let prefixes = match self.chunks.list_sessions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to scan chunk directory for orphaned sessions");
                return 0;
            }
        };

        let found: Vec<PrefixMeta> = {
            let sessions = self.sessions();
            prefixes
                .into_iter()
                .filter(|p| {
                    UploadId::parse(&p.name)
                        .map(|id| !sessions.contains_key(&id))
                        .unwrap_or(false)
                })
                .collect()
        };
        let count = found.len();
        if count > 0 {
            info!(count, "Found orphaned upload session directories");
        }
        *self.orphans_mut() = found;
        count
    }

    /// Evict sessions older than the retention window and remove aged
    /// orphan directories.
    ///
    /// Sessions currently held (being assembled or receiving a chunk) are
    /// skipped until the next pass. Storage failures are logged.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let retention = self.limits.retention;
        let mut report = SweepReport::default();

        let expired: Vec<Arc<SessionSlot>> = self
            .sessions()
            .values()
            .filter(|s| now - s.created_at > retention)
            .cloned()
            .collect();

        for slot in expired {
            let Ok(_gate) = slot.gate.clone().try_write_owned() else {
                debug!(upload_id = %slot.id, "Expired session is busy, skipping this pass");
                continue;
            };
            info!(
                upload_id = %slot.id,
                filename = %slot.params.filename,
                received_chunks = slot.received_count(),
                total_chunks = slot.params.total_chunks,
                age_secs = (now - slot.created_at).whole_seconds(),
                "Evicting expired upload session"
            );
            self.evict_locked(&slot, "expired").await;
            report.expired += 1;
        }

        let aged: Vec<PrefixMeta> = {
            let mut orphans = self.orphans_mut();
            let (aged, young): (Vec<_>, Vec<_>) = std::mem::take(&mut *orphans)
                .into_iter()
                .partition(|o| o.last_modified.is_some_and(|m| now - m > retention));
            *orphans = young;
            aged
        };
        for orphan in aged {
            if UploadId::parse(&orphan.name).is_ok_and(|id| self.get(&id).is_some()) {
                continue;
            }
            match self.chunks.remove_prefix(&orphan.name).await {
                Ok(()) => {
                    info!(prefix = %orphan.name, "Removed orphaned session directory");
                    report.orphans += 1;
                }
                Err(e) => {
                    warn!(prefix = %orphan.name, error = %e, "Failed to remove orphaned session directory");
                }
            }
        }

        report
    }
}
