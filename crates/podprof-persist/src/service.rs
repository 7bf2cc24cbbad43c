//! The persistence trait consumed by the collector core.

use std::sync::Arc;

use podprof_model::{PodDataAccumulated, PodIdRestart, PodStatus, StreamRegistry, StreamType};

use crate::error::PersistResult;
use crate::records::{MetaBatch, PodInit, StreamChunk};

/// Shared handle to a persistence adapter.
pub type SharedPersistence = Arc<dyn Persistence>;

/// Batch-oriented persistence operations.
///
/// Implementations batch internally (the collector calls these from hot
/// per-connection paths) and must be safe for concurrent use across
/// connection tasks and background flush loops.
pub trait Persistence: Send + Sync {
    // ── Stream registries ────────────────────────────────────────────

    /// Inserts or updates one rotation-instance record.
    fn upsert_stream_registry(&self, registry: &StreamRegistry) -> PersistResult<()>;

    /// Highest persisted rolling sequence id for a (pod, stream type)
    /// pair; `None` when nothing has been persisted yet.
    fn last_rolling_sequence_id(
        &self,
        pod: &PodIdRestart,
        stream: StreamType,
    ) -> PersistResult<Option<i32>>;

    /// Appends one stream payload chunk.
    fn insert_stream_chunk(&self, chunk: StreamChunk) -> PersistResult<()>;

    // ── Pods ─────────────────────────────────────────────────────────

    /// Loads previously persisted state for a connecting pod, creating a
    /// fresh record when none exists.
    fn initialize_pod(&self, status: &PodStatus) -> PersistResult<PodInit>;

    /// Updates a pod's last-active / last-restart bookkeeping.
    fn update_last_active(&self, status: &PodStatus) -> PersistResult<()>;

    /// Appends one statistics snapshot of accumulated byte counters.
    fn insert_pod_statistics(
        &self,
        pod: &PodIdRestart,
        accumulated: &PodDataAccumulated,
    ) -> PersistResult<()>;

    // ── Metadata streams ─────────────────────────────────────────────

    /// Bulk-saves a drained batch of decoded metadata records.
    fn save_meta_batch(&self, batch: &MetaBatch) -> PersistResult<()>;
}
