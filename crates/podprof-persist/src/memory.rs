//! In-memory persistence, for tests and standalone runs.
//!
//! Keeps every record in plain maps/vectors behind one mutex. Not meant
//! for production retention — the point is an inspectable, dependency-free
//! stand-in with the exact semantics the collector relies on (upsert
//! keys, sequence-id lookups, pod initialization overrides).

use std::collections::HashMap;
use std::sync::Mutex;

use podprof_model::{
    PodDataAccumulated, PodIdRestart, PodStatus, StreamRegistry, StreamType,
};

use crate::error::PersistResult;
use crate::records::{
    DictionaryRecord, MetaBatch, ParamRecord, PodInit, StreamChunk, SuspendRecord,
};
use crate::service::Persistence;

/// (pod incarnation, stream type, rolling sequence id) registry key.
type RegistryKey = (String, StreamType, i32);

#[derive(Debug, Default)]
struct Inner {
    registries: HashMap<RegistryKey, StreamRegistry>,
    chunks: Vec<StreamChunk>,
    /// Pod incarnation screen-name → persisted pod state.
    pods: HashMap<String, PodRecord>,
    statistics: Vec<(PodIdRestart, PodDataAccumulated)>,
    dictionary: Vec<DictionaryRecord>,
    params: Vec<ParamRecord>,
    suspends: Vec<SuspendRecord>,
}

#[derive(Debug, Clone)]
struct PodRecord {
    active_since_ms: u64,
    last_active_ms: u64,
    accumulated: PodDataAccumulated,
}

/// Mutex-backed in-memory [`Persistence`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    inner: Mutex<Inner>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(registry: &StreamRegistry) -> RegistryKey {
        (
            registry.pod.screen_name(),
            registry.stream,
            registry.rolling_sequence_id,
        )
    }

    // ── Test inspection ──────────────────────────────────────────────

    pub fn registries_for(&self, pod: &PodIdRestart, stream: StreamType) -> Vec<StreamRegistry> {
        let inner = self.inner.lock().unwrap();
        let screen = pod.screen_name();
        let mut found: Vec<StreamRegistry> = inner
            .registries
            .values()
            .filter(|r| r.pod.screen_name() == screen && r.stream == stream)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.rolling_sequence_id);
        found
    }

    pub fn chunks(&self) -> Vec<StreamChunk> {
        self.inner.lock().unwrap().chunks.clone()
    }

    pub fn chunk_payload(&self, pod: &PodIdRestart, stream: StreamType) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let screen = pod.screen_name();
        let mut chunks: Vec<&StreamChunk> = inner
            .chunks
            .iter()
            .filter(|c| c.pod.screen_name() == screen && c.stream == stream)
            .collect();
        chunks.sort_by_key(|c| (c.rolling_sequence_id, c.start_pos));
        chunks.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    pub fn statistics_count(&self) -> usize {
        self.inner.lock().unwrap().statistics.len()
    }

    pub fn dictionary_records(&self) -> Vec<DictionaryRecord> {
        self.inner.lock().unwrap().dictionary.clone()
    }

    pub fn param_records(&self) -> Vec<ParamRecord> {
        self.inner.lock().unwrap().params.clone()
    }

    pub fn suspend_records(&self) -> Vec<SuspendRecord> {
        self.inner.lock().unwrap().suspends.clone()
    }

    pub fn known_pod_count(&self) -> usize {
        self.inner.lock().unwrap().pods.len()
    }
}

impl Persistence for InMemoryPersistence {
    fn upsert_stream_registry(&self, registry: &StreamRegistry) -> PersistResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .registries
            .insert(Self::key(registry), registry.clone());
        Ok(())
    }

    fn last_rolling_sequence_id(
        &self,
        pod: &PodIdRestart,
        stream: StreamType,
    ) -> PersistResult<Option<i32>> {
        let inner = self.inner.lock().unwrap();
        let screen = pod.screen_name();
        Ok(inner
            .registries
            .values()
            .filter(|r| r.pod.screen_name() == screen && r.stream == stream)
            .map(|r| r.rolling_sequence_id)
            .max())
    }

    fn insert_stream_chunk(&self, chunk: StreamChunk) -> PersistResult<()> {
        self.inner.lock().unwrap().chunks.push(chunk);
        Ok(())
    }

    fn initialize_pod(&self, status: &PodStatus) -> PersistResult<PodInit> {
        let mut inner = self.inner.lock().unwrap();
        let screen = status.screen_name();
        match inner.pods.get(&screen) {
            Some(existing) => Ok(PodInit {
                active_since_ms: Some(existing.active_since_ms),
                accumulated: Some(existing.accumulated.clone()),
            }),
            None => {
                inner.pods.insert(
                    screen,
                    PodRecord {
                        active_since_ms: status.active_since_ms,
                        last_active_ms: status.last_active_ms,
                        accumulated: PodDataAccumulated::default(),
                    },
                );
                Ok(PodInit::default())
            }
        }
    }

    fn update_last_active(&self, status: &PodStatus) -> PersistResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let screen = status.screen_name();
        if let Some(record) = inner.pods.get_mut(&screen) {
            record.last_active_ms = status.last_active_ms;
            record.accumulated = status.accumulated.clone();
        }
        Ok(())
    }

    fn insert_pod_statistics(
        &self,
        pod: &PodIdRestart,
        accumulated: &PodDataAccumulated,
    ) -> PersistResult<()> {
        self.inner
            .lock()
            .unwrap()
            .statistics
            .push((pod.clone(), accumulated.clone()));
        Ok(())
    }

    fn save_meta_batch(&self, batch: &MetaBatch) -> PersistResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match batch {
            MetaBatch::Dictionary(records) => inner.dictionary.extend(records.iter().cloned()),
            MetaBatch::Params(records) => inner.params.extend(records.iter().cloned()),
            MetaBatch::Suspend(records) => inner.suspends.extend(records.iter().cloned()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podprof_model::{StreamInfoRequest, StreamStatus};

    fn pod() -> PodIdRestart {
        PodIdRestart::parse_original("esc-test-service-58dfcb97-n4f7w_1675853926859").unwrap()
    }

    fn registry(seq: i32) -> StreamRegistry {
        StreamRegistry::create(
            &StreamInfoRequest {
                pod: pod(),
                stream: StreamType::Calls,
                requested_rolling_sequence_id: seq,
                reset_required: false,
                force_requested_rolling_sequence_id: false,
                created_ms: 1_000,
            },
            seq,
        )
    }

    #[test]
    fn upsert_overwrites_same_rotation_instance() {
        let store = InMemoryPersistence::new();
        let reg = registry(0);
        store.upsert_stream_registry(&reg).unwrap();
        store.upsert_stream_registry(&reg.close(2_000)).unwrap();

        let found = store.registries_for(&pod(), StreamType::Calls);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, StreamStatus::Finished);
    }

    #[test]
    fn sequence_lookup_reports_max_persisted() {
        let store = InMemoryPersistence::new();
        assert_eq!(
            store
                .last_rolling_sequence_id(&pod(), StreamType::Calls)
                .unwrap(),
            None
        );

        store.upsert_stream_registry(&registry(0)).unwrap();
        store.upsert_stream_registry(&registry(3)).unwrap();
        assert_eq!(
            store
                .last_rolling_sequence_id(&pod(), StreamType::Calls)
                .unwrap(),
            Some(3)
        );
        assert_eq!(
            store
                .last_rolling_sequence_id(&pod(), StreamType::Trace)
                .unwrap(),
            None
        );
    }

    #[test]
    fn initialize_pod_returns_overrides_for_known_incarnation() {
        let store = InMemoryPersistence::new();
        let mut status = PodStatus::empty(1_000);
        status.set_pod_name("esc-test-service-58dfcb97-n4f7w_1675853926859");

        let first = store.initialize_pod(&status).unwrap();
        assert_eq!(first, PodInit::default());

        let second = store.initialize_pod(&status).unwrap();
        assert_eq!(
            second.active_since_ms,
            Some(status.active_since_ms)
        );
        assert!(second.accumulated.is_some());
    }

    #[test]
    fn registry_record_is_json_serializable() {
        // Storage adapters serialize registry values; the record must
        // round-trip losslessly.
        let reg = registry(7);
        let json = serde_json::to_string(&reg).unwrap();
        let back: StreamRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reg);
    }
}
