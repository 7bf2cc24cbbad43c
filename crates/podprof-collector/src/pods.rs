//! Pod activity tracker.
//!
//! Bounded cache of per-pod status for pods active within the retention
//! window, plus accumulated byte counters persisted as periodic
//! statistics snapshots. Connection tasks feed `received`/`persisted`
//! from their hot paths; a single background loop flushes.
//!
//! The flush is single-flight: an invocation that finds another one
//! running is skipped, not queued. Counters are snapshot-and-swapped
//! under the tracker lock, so updates racing a flush land in the next
//! cycle instead of being lost.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use podprof_model::time::now_ms;
use podprof_model::{CollectorConfig, PodDataAccumulated, PodIdRestart, PodStatus, StreamType};
use podprof_persist::{PersistResult, SharedPersistence};

struct CachedPod {
    status: PodStatus,
    last_seen_ms: u64,
}

#[derive(Default)]
struct TrackerInner {
    /// pod id (without restart timestamp) → live status.
    pods: HashMap<String, CachedPod>,
    /// Counters pending the next statistics snapshot, keyed by incarnation.
    accumulated: HashMap<PodIdRestart, PodDataAccumulated>,
    prev_persist_ms: u64,
}

/// Tracks per-pod activity and accumulated byte counters.
pub struct PodTracker {
    persistence: SharedPersistence,
    inner: Mutex<TrackerInner>,
    flush_in_progress: AtomicBool,
    /// Entries idle longer than this are evicted during a flush cycle.
    retention_ms: u64,
    max_pods: usize,
}

impl PodTracker {
    pub fn new(config: &CollectorConfig, persistence: SharedPersistence) -> Self {
        Self {
            persistence,
            inner: Mutex::new(TrackerInner::default()),
            flush_in_progress: AtomicBool::new(false),
            retention_ms: config.retention_period_ms,
            max_pods: config.max_connections() * 2,
        }
    }

    /// Registers a connecting pod: loads previously persisted state when
    /// the incarnation is already known, otherwise creates a fresh record;
    /// then triggers an immediate flush cycle.
    pub fn init_pod(&self, mut status: PodStatus) -> PersistResult<()> {
        let init = self.persistence.initialize_pod(&status)?;
        if let Some(active_since) = init.active_since_ms {
            status.override_active_since(active_since);
        }
        if let Some(accumulated) = init.accumulated {
            status.override_accumulated(accumulated);
        }

        {
            let mut inner = self.inner.lock().unwrap();
            info!(pod = %status.screen_name(), "pod registered with activity tracker");
            inner.pods.insert(
                status.pod_id().to_string(),
                CachedPod {
                    status,
                    last_seen_ms: now_ms(),
                },
            );
        }

        self.scheduled_flush();
        Ok(())
    }

    /// Records bytes received from the agent for one stream. Metadata
    /// streams count as persisted immediately (see [`PodStatus::received`]).
    pub fn received(&self, pod: &PodIdRestart, stream: StreamType, bytes: usize) {
        self.update(pod, |status| status.received(stream, bytes as u64));
    }

    /// Records bytes actually persisted for one stream.
    pub fn persisted(&self, pod: &PodIdRestart, stream: StreamType, bytes: usize) {
        self.update(pod, |status| status.persisted(stream, bytes as u64));
    }

    fn update(&self, pod: &PodIdRestart, apply: impl FnOnce(&mut PodStatus)) {
        let mut inner = self.inner.lock().unwrap();
        let Some(cached) = inner.pods.get_mut(pod.pod_id()) else {
            // Pod was never initialized or already evicted; nothing to
            // account against.
            return;
        };
        apply(&mut cached.status);
        cached.last_seen_ms = now_ms();
        let accumulated = cached.status.accumulated.clone();
        inner.accumulated.insert(pod.clone(), accumulated);
    }

    /// Touches a pod's last-active timestamp.
    pub fn touch(&self, pod: &PodIdRestart) {
        self.update(pod, |status| status.touch(now_ms()));
    }

    /// One flush cycle: persist last-active updates for pods touched since
    /// the previous cycle, one statistics snapshot per pod with nonzero
    /// counters, then clear counters and advance the cycle marker.
    /// Overlapping invocations are skipped.
    pub fn scheduled_flush(&self) {
        if self.flush_in_progress.swap(true, Ordering::SeqCst) {
            debug!("pod statistics flush already running, skipping");
            return;
        }

        let now = now_ms();
        let (updates, stats) = {
            let mut inner = self.inner.lock().unwrap();
            self.evict(&mut inner, now);

            let prev = inner.prev_persist_ms;
            let updates: Vec<PodStatus> = inner
                .pods
                .values()
                .filter(|p| p.status.is_updated_after(prev))
                .map(|p| p.status.clone())
                .collect();

            let stats: Vec<(PodIdRestart, PodDataAccumulated)> =
                std::mem::take(&mut inner.accumulated)
                    .into_iter()
                    .filter(|(_, acc)| !acc.is_empty())
                    .collect();

            for pod in inner.pods.values_mut() {
                pod.status.accumulated = PodDataAccumulated::default();
            }

            (updates, stats)
        };

        if !updates.is_empty() {
            debug!(pods = updates.len(), "persisting pod activity updates");
        }
        for status in &updates {
            if let Err(e) = self.persistence.update_last_active(status) {
                warn!(pod = %status.screen_name(), error = %e, "failed to persist pod activity");
            }
        }

        if !stats.is_empty() {
            debug!(pods = stats.len(), "persisting pod statistics snapshots");
        }
        for (pod, accumulated) in &stats {
            if let Err(e) = self.persistence.insert_pod_statistics(pod, accumulated) {
                warn!(pod = %pod, error = %e, "failed to persist pod statistics");
            }
        }

        self.inner.lock().unwrap().prev_persist_ms = now;
        self.flush_in_progress.store(false, Ordering::SeqCst);
    }

    fn evict(&self, inner: &mut TrackerInner, now: u64) {
        inner
            .pods
            .retain(|_, p| now.saturating_sub(p.last_seen_ms) <= self.retention_ms);

        // Size cap: drop the stalest entries beyond the bound.
        while inner.pods.len() > self.max_pods {
            let stalest = inner
                .pods
                .iter()
                .min_by_key(|(_, p)| p.last_seen_ms)
                .map(|(k, _)| k.clone());
            match stalest {
                Some(key) => {
                    debug!(pod = %key, "evicting pod from activity cache (over capacity)");
                    inner.pods.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn cached_pod_count(&self) -> usize {
        self.inner.lock().unwrap().pods.len()
    }

    /// Periodic flush loop; exits when the shutdown channel fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "pod statistics flush loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh collector
        // does not persist an empty cycle at startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scheduled_flush(),
                _ = shutdown.changed() => break,
            }
        }
        // Final cycle so counters from the last window are not dropped.
        self.scheduled_flush();
        info!("pod statistics flush loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use podprof_persist::InMemoryPersistence;

    fn status(original: &str) -> PodStatus {
        let mut status = PodStatus::empty(1_000);
        status.set_namespace("prod");
        status.set_microservice("esc-test-service");
        status.set_pod_name(original);
        status
    }

    fn tracker(store: Arc<InMemoryPersistence>) -> PodTracker {
        PodTracker::new(&CollectorConfig::default(), store)
    }

    #[test]
    fn init_pod_persists_and_caches() {
        let store = Arc::new(InMemoryPersistence::new());
        let tracker = tracker(store.clone());

        tracker
            .init_pod(status("esc-test-service-58dfcb97-n4f7w_1675853926859"))
            .unwrap();
        assert_eq!(tracker.cached_pod_count(), 1);
        assert_eq!(store.known_pod_count(), 1);
    }

    #[test]
    fn flush_snapshots_and_clears_counters() {
        let store = Arc::new(InMemoryPersistence::new());
        let tracker = tracker(store.clone());

        let status = status("esc-test-service-58dfcb97-n4f7w_1675853926859");
        let pod = status.id.clone();
        tracker.init_pod(status).unwrap();

        tracker.received(&pod, StreamType::Calls, 100);
        tracker.received(&pod, StreamType::Dictionary, 40);

        let before = store.statistics_count();
        tracker.scheduled_flush();
        assert_eq!(store.statistics_count(), before + 1);

        // Counters cleared: a flush with no new data adds no snapshot.
        tracker.scheduled_flush();
        assert_eq!(store.statistics_count(), before + 1);
    }

    #[test]
    fn counters_for_unknown_pods_are_dropped() {
        let store = Arc::new(InMemoryPersistence::new());
        let tracker = tracker(store.clone());

        let pod = PodIdRestart::parse_original("esc-test-service-58dfcb97-n4f7w_1675853926859")
            .unwrap();
        tracker.received(&pod, StreamType::Calls, 100);

        tracker.scheduled_flush();
        assert_eq!(store.statistics_count(), 0);
    }
}
