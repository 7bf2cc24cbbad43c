//! Stream registry and rotation engine.
//!
//! Owns the handle → sink map shared by every connection task. At most
//! one handle is authoritative per (pod, stream type): opening a new one
//! closes and evicts any prior handle for the same pair. The map is
//! bounded at the configured max open streams with least-recently-used
//! eviction.
//!
//! Locking: `receive` lookups take only the read lock; structural
//! mutations (open/close/evict/cleanup) take the write lock for map
//! operations only, never across persistence I/O of payload data. Each
//! sink carries its own mutex — stream bytes for one handle arrive in
//! order from a single connection task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, trace};
use uuid::Uuid;

use podprof_model::time::now_ms;
use podprof_model::{CollectorConfig, StreamInfoRequest, StreamRegistry, StreamType};
use podprof_persist::SharedPersistence;

use crate::error::{CollectorError, CollectorResult};
use crate::pods::PodTracker;
use crate::streams::sink::StreamSink;

struct OpenStream {
    registry: Mutex<StreamRegistry>,
    sink: Mutex<StreamSink>,
    last_used: AtomicU64,
}

/// Result of opening (rotating) a stream.
#[derive(Debug)]
pub struct StreamOpened {
    pub handle: Uuid,
    pub rolling_sequence_id: i32,
    /// Handles invalidated by this open; the caller stops tracking them.
    pub cleaned_up: Vec<Uuid>,
}

/// Multiplexes every logical stream of every connection through one
/// bounded handle → sink map.
pub struct StreamHub {
    config: Arc<CollectorConfig>,
    persistence: SharedPersistence,
    pods: Arc<PodTracker>,
    open: RwLock<HashMap<Uuid, Arc<OpenStream>>>,
    lru_clock: AtomicU64,
}

impl StreamHub {
    pub fn new(
        config: Arc<CollectorConfig>,
        persistence: SharedPersistence,
        pods: Arc<PodTracker>,
    ) -> Self {
        Self {
            config,
            persistence,
            pods,
            open: RwLock::new(HashMap::new()),
            lru_clock: AtomicU64::new(0),
        }
    }

    pub fn rotation_period(&self, stream: StreamType) -> i64 {
        self.config.rotation_period(stream)
    }

    pub fn required_rotation_size(&self, stream: StreamType) -> i64 {
        self.config.required_rotation_size(stream)
    }

    /// Opens a new rotation instance: closes any prior handle for the same
    /// (pod, stream type), resolves the rolling sequence id, persists the
    /// new registry as Created, and installs the sink.
    pub fn stream_opened(&self, request: &StreamInfoRequest) -> CollectorResult<StreamOpened> {
        let cleaned_up = self.cleanup_for_pod_and_type(request.pod.pod_id(), request.stream);

        let seq_id = if request.force_requested_rolling_sequence_id {
            request.requested_rolling_sequence_id
        } else {
            self.calculate_rolling_sequence_id(request)?
        };

        let handle = Uuid::new_v4();
        let registry = StreamRegistry::create(request, seq_id);
        self.persistence.upsert_stream_registry(&registry)?;

        let sink = StreamSink::for_stream(
            handle,
            request.pod.clone(),
            request.stream,
            seq_id,
            self.config.stream_chunk_size,
            self.persistence.clone(),
            self.pods.clone(),
        );

        {
            let mut open = self.open.write().unwrap();
            if open.len() >= self.config.max_open_streams() {
                self.evict_lru(&mut open);
            }
            open.insert(
                handle,
                Arc::new(OpenStream {
                    registry: Mutex::new(registry),
                    sink: Mutex::new(sink),
                    last_used: AtomicU64::new(self.tick()),
                }),
            );
        }

        debug!(
            pod = %request.pod,
            stream = %request.stream,
            %handle,
            seq = seq_id,
            "stream opened"
        );
        Ok(StreamOpened {
            handle,
            rolling_sequence_id: seq_id,
            cleaned_up,
        })
    }

    /// Monotonic per (pod, stream type): the larger of the requested id
    /// and one past the last persisted id, tolerating absent state.
    fn calculate_rolling_sequence_id(&self, request: &StreamInfoRequest) -> CollectorResult<i32> {
        let last = self
            .persistence
            .last_rolling_sequence_id(&request.pod, request.stream)?
            .unwrap_or(-1);
        Ok(request.requested_rolling_sequence_id.max(last + 1))
    }

    /// Routes data to an open handle's sink and accounts the bytes.
    pub fn receive(&self, handle: Uuid, data: &[u8]) -> CollectorResult<()> {
        let slot = {
            let open = self.open.read().unwrap();
            open.get(&handle).cloned()
        }
        .ok_or(CollectorError::StreamNotInitialized(handle))?;

        slot.last_used.store(self.tick(), Ordering::Relaxed);

        let (pod, stream) = {
            let mut registry = slot.registry.lock().unwrap();
            registry.received(data.len(), now_ms());
            (registry.pod.clone(), registry.stream)
        };

        trace!(%handle, stream = %stream, bytes = data.len(), "stream data received");
        slot.sink.lock().unwrap().receive(data)?;
        self.pods.received(&pod, stream, data.len());
        Ok(())
    }

    /// Flushes each served handle's sink if its own policy says so.
    /// Handles whose sink is gone (already cleaned up) are dropped from
    /// the set, as are handles that flushed.
    pub fn flush_due(&self, handles: &mut HashSet<Uuid>) {
        handles.retain(|handle| {
            let slot = {
                let open = self.open.read().unwrap();
                open.get(handle).cloned()
            };
            let Some(slot) = slot else {
                debug!(%handle, "not flushing stream, already cleaned up");
                return false;
            };
            match slot.sink.lock().unwrap().flush_if_due() {
                Ok(flushed) => !flushed,
                Err(e) => {
                    error!(%handle, error = %e, "failed to flush stream");
                    false
                }
            }
        });
    }

    /// Closes a handle and evicts it. Idempotent; close errors are logged,
    /// never propagated — rotation must not fail because cleanup failed.
    pub fn close_and_forget(&self, handle: Uuid) {
        let slot = self.open.write().unwrap().remove(&handle);
        if let Some(slot) = slot {
            self.close_slot(handle, &slot);
        }
    }

    /// Closes every open handle for a pod (reconnect/restart path) and
    /// returns the closed handles so callers stop tracking them.
    pub fn cleanup_for_pod(&self, pod_id: &str) -> Vec<Uuid> {
        self.cleanup_matching(|registry| registry.pod.pod_id() == pod_id)
    }

    /// Closes every open handle for one (pod, stream type) pair.
    pub fn cleanup_for_pod_and_type(&self, pod_id: &str, stream: StreamType) -> Vec<Uuid> {
        self.cleanup_matching(|registry| {
            registry.pod.pod_id() == pod_id && registry.stream == stream
        })
    }

    fn cleanup_matching(&self, matches: impl Fn(&StreamRegistry) -> bool) -> Vec<Uuid> {
        let removed: Vec<(Uuid, Arc<OpenStream>)> = {
            let mut open = self.open.write().unwrap();
            let handles: Vec<Uuid> = open
                .iter()
                .filter(|(_, slot)| matches(&slot.registry.lock().unwrap()))
                .map(|(handle, _)| *handle)
                .collect();
            handles
                .into_iter()
                .filter_map(|h| open.remove(&h).map(|slot| (h, slot)))
                .collect()
        };

        if !removed.is_empty() {
            debug!(count = removed.len(), "cleaning up open streams");
        }
        removed
            .into_iter()
            .map(|(handle, slot)| {
                self.close_slot(handle, &slot);
                handle
            })
            .collect()
    }

    fn close_slot(&self, handle: Uuid, slot: &OpenStream) {
        let mut sink = slot.sink.lock().unwrap();
        if let Err(e) = sink.close() {
            let registry = slot.registry.lock().unwrap();
            error!(
                stream = %registry.screen_name(),
                error = %e,
                "failed to close stream sink"
            );
        }

        let closed = {
            let mut registry = slot.registry.lock().unwrap();
            registry.persisted_bytes = sink.persisted_bytes();
            registry.close(now_ms())
        };
        debug!(stream = %closed.screen_name(), %handle, "stream closed");
        if let Err(e) = self.persistence.upsert_stream_registry(&closed) {
            error!(
                stream = %closed.screen_name(),
                error = %e,
                "failed to persist closed stream registry"
            );
        }
    }

    fn evict_lru(&self, open: &mut HashMap<Uuid, Arc<OpenStream>>) {
        let oldest = open
            .iter()
            .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
            .map(|(handle, _)| *handle);
        if let Some(handle) = oldest {
            debug!(%handle, "evicting least-recently-used open stream");
            if let Some(slot) = open.remove(&handle) {
                self.close_slot(handle, &slot);
            }
        }
    }

    fn tick(&self) -> u64 {
        self.lru_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn open_stream_count(&self) -> usize {
        self.open.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use podprof_model::{PodIdRestart, PodStatus, StreamStatus};
    use podprof_persist::InMemoryPersistence;

    struct Fixture {
        store: Arc<InMemoryPersistence>,
        hub: StreamHub,
    }

    fn fixture() -> Fixture {
        fixture_with(CollectorConfig::default())
    }

    fn fixture_with(config: CollectorConfig) -> Fixture {
        let store = Arc::new(InMemoryPersistence::new());
        let config = Arc::new(config);
        let pods = Arc::new(PodTracker::new(&config, store.clone()));
        let hub = StreamHub::new(config, store.clone(), pods);
        Fixture { store, hub }
    }

    fn pod(original: &str) -> PodIdRestart {
        PodIdRestart::parse_original(original).unwrap()
    }

    fn request(pod: &PodIdRestart, stream: StreamType, seq: i32, force: bool) -> StreamInfoRequest {
        let mut status = PodStatus::empty(1_000);
        status.id = pod.clone();
        status.new_stream_request(now_ms(), stream, seq, false, force)
    }

    #[test]
    fn sequence_resolves_zero_then_increments() {
        let f = fixture();
        let p = pod("esc-test-service-58dfcb97-n4f7w_1675853926859");

        let first = f
            .hub
            .stream_opened(&request(&p, StreamType::Calls, -1, false))
            .unwrap();
        assert_eq!(first.rolling_sequence_id, 0);

        let second = f
            .hub
            .stream_opened(&request(&p, StreamType::Calls, -1, false))
            .unwrap();
        assert_eq!(second.rolling_sequence_id, 1);

        // Forcing a specific id wins over the running counter.
        let forced = f
            .hub
            .stream_opened(&request(&p, StreamType::Calls, 5, true))
            .unwrap();
        assert_eq!(forced.rolling_sequence_id, 5);
    }

    #[test]
    fn reopen_closes_exactly_the_prior_handle_for_the_pair() {
        let f = fixture();
        let p = pod("esc-test-service-58dfcb97-n4f7w_1675853926859");

        let calls = f
            .hub
            .stream_opened(&request(&p, StreamType::Calls, -1, false))
            .unwrap();
        let trace = f
            .hub
            .stream_opened(&request(&p, StreamType::Trace, -1, false))
            .unwrap();

        let rotated = f
            .hub
            .stream_opened(&request(&p, StreamType::Calls, -1, false))
            .unwrap();
        assert_eq!(rotated.cleaned_up, vec![calls.handle]);

        // The trace handle is untouched.
        assert!(f.hub.receive(trace.handle, b"t").is_ok());
        // The rotated-out handle is gone.
        assert!(matches!(
            f.hub.receive(calls.handle, b"x"),
            Err(CollectorError::StreamNotInitialized(_))
        ));

        let registries = f.store.registries_for(&p, StreamType::Calls);
        assert_eq!(registries.len(), 2);
        assert_eq!(registries[0].status, StreamStatus::Finished);
        assert_eq!(registries[1].status, StreamStatus::Created);
    }

    #[test]
    fn receive_on_unknown_handle_is_not_initialized() {
        let f = fixture();
        assert!(matches!(
            f.hub.receive(Uuid::new_v4(), b"data"),
            Err(CollectorError::StreamNotInitialized(_))
        ));
    }

    #[test]
    fn cleanup_for_pod_spares_other_pods() {
        let f = fixture();
        let a = pod("esc-test-service-58dfcb97-n4f7w_1675853926859");
        let b = pod("other-service-7f9c1b22-x2k8q_1675853926900");

        let a_calls = f
            .hub
            .stream_opened(&request(&a, StreamType::Calls, -1, false))
            .unwrap();
        let b_calls = f
            .hub
            .stream_opened(&request(&b, StreamType::Calls, -1, false))
            .unwrap();

        let closed = f.hub.cleanup_for_pod(a.pod_id());
        assert_eq!(closed, vec![a_calls.handle]);
        assert!(f.hub.receive(b_calls.handle, b"ok").is_ok());
    }

    #[test]
    fn close_and_forget_is_idempotent() {
        let f = fixture();
        let p = pod("esc-test-service-58dfcb97-n4f7w_1675853926859");
        let opened = f
            .hub
            .stream_opened(&request(&p, StreamType::Calls, -1, false))
            .unwrap();

        f.hub.close_and_forget(opened.handle);
        f.hub.close_and_forget(opened.handle);

        let registries = f.store.registries_for(&p, StreamType::Calls);
        assert_eq!(registries.len(), 1);
        assert_eq!(registries[0].status, StreamStatus::Finished);
    }

    #[test]
    fn final_size_lands_in_the_finished_registry() {
        let f = fixture();
        let p = pod("esc-test-service-58dfcb97-n4f7w_1675853926859");
        let opened = f
            .hub
            .stream_opened(&request(&p, StreamType::Calls, -1, false))
            .unwrap();

        f.hub.receive(opened.handle, &[7u8; 100]).unwrap();
        f.hub.close_and_forget(opened.handle);

        let registries = f.store.registries_for(&p, StreamType::Calls);
        assert_eq!(registries[0].received_bytes, 100);
        assert_eq!(registries[0].persisted_bytes, 100);
    }

    #[test]
    fn cache_is_bounded_by_lru_eviction() {
        // 1 client × 11 stream types = 11 open streams max.
        let config = CollectorConfig {
            num_heavy_clients: 0,
            num_idle_clients: 1,
            ..Default::default()
        };
        let f = fixture_with(config);
        let p = pod("esc-test-service-58dfcb97-n4f7w_1675853926859");

        // 11 distinct (pod, type) pairs fill the cache; a 12th from a
        // second pod forces an eviction of the least recently used.
        for stream in StreamType::ALL {
            f.hub
                .stream_opened(&request(&p, stream, -1, false))
                .unwrap();
        }
        assert_eq!(f.hub.open_stream_count(), 11);

        let other = pod("other-service-7f9c1b22-x2k8q_1675853926900");
        f.hub
            .stream_opened(&request(&other, StreamType::Calls, -1, false))
            .unwrap();
        assert_eq!(f.hub.open_stream_count(), 11);
    }
}
