//! Per-connection timing/idle/flush bookkeeping.
//!
//! Pure state, no I/O. One connection task owns the command sequence; the
//! supervisor reads idle predicates and raises the shutdown flag from
//! outside, so everything here is atomics plus a mutex around the pod
//! identity (which mutates during the handshake).
//!
//! Conceptual lifecycle: handshaking (pod identity empty) → active →
//! shutdown-requested → dead (socket closed, or idle beyond threshold).
//! A connection gets one grace period to self-terminate: `is_dead` trips
//! at the idle threshold, the supervisor's forced kill at twice that.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use podprof_model::PodStatus;
use podprof_model::time::now_ms;
use podprof_wire::consts::{FLUSH_CHECK_INTERVAL, MAX_IDLE_BEFORE_DEATH, SOCKET_READ_TIMEOUT};

/// Shared state of one agent connection.
pub struct ConnState {
    /// Pod identity; filled in during the handshake.
    pub pod: Mutex<PodStatus>,
    /// Remote address, for log context before the pod is known.
    address: String,
    connected_ms: u64,
    agent_uptime_secs: AtomicU64,
    last_accessed_ms: AtomicU64,
    /// 0 = never flushed.
    last_flushed_ms: AtomicU64,
    last_sink_flush_ms: AtomicU64,
    being_processed: AtomicBool,
    shutdown_requested: AtomicBool,
    socket_closed: AtomicBool,
    idle_death: Duration,
    flush_check_interval: Duration,
    /// Output sits unflushed at most this long (half the read timeout,
    /// so the agent sees data well before its own read deadline).
    need_flush_after: Duration,
}

impl ConnState {
    pub fn new(address: String) -> Self {
        Self::with_thresholds(address, MAX_IDLE_BEFORE_DEATH, FLUSH_CHECK_INTERVAL, SOCKET_READ_TIMEOUT / 2)
    }

    /// Custom thresholds (for tests and config overrides).
    pub fn with_thresholds(
        address: String,
        idle_death: Duration,
        flush_check_interval: Duration,
        need_flush_after: Duration,
    ) -> Self {
        let now = now_ms();
        Self {
            pod: Mutex::new(PodStatus::empty(now)),
            address,
            connected_ms: now,
            agent_uptime_secs: AtomicU64::new(0),
            last_accessed_ms: AtomicU64::new(now),
            last_flushed_ms: AtomicU64::new(0),
            last_sink_flush_ms: AtomicU64::new(0),
            being_processed: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            socket_closed: AtomicBool::new(false),
            idle_death,
            flush_check_interval,
            need_flush_after,
        }
    }

    /// Resets the idle clock and recomputes uptime; called for every
    /// processed command.
    pub fn accessed(&self) {
        let now = now_ms();
        self.last_accessed_ms.store(now, Ordering::Relaxed);
        self.agent_uptime_secs
            .store(now.saturating_sub(self.connected_ms) / 1000, Ordering::Relaxed);
    }

    pub fn processed(&self, being_processed: bool) {
        self.being_processed.store(being_processed, Ordering::SeqCst);
    }

    /// Asks the owning task to close gracefully; the receive loop
    /// observes this flag.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn needs_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn mark_socket_closed(&self) {
        self.socket_closed.store(true, Ordering::SeqCst);
    }

    pub fn socket_closed(&self) -> bool {
        self.socket_closed.load(Ordering::SeqCst)
    }

    /// Stamps both flush clocks.
    pub fn mark_flushed(&self) {
        let now = now_ms();
        self.last_flushed_ms.store(now, Ordering::Relaxed);
        self.last_sink_flush_ms.store(now, Ordering::Relaxed);
    }

    /// Output has sat unflushed past the batching window.
    pub fn need_flush(&self) -> bool {
        now_ms().saturating_sub(self.last_sink_flush_ms.load(Ordering::Relaxed))
            > self.need_flush_after.as_millis() as u64
    }

    /// The periodic flush-check interval elapsed (or never flushed), so an
    /// idle connection still gets a chance to flush buffered output.
    pub fn needs_flush_check(&self) -> bool {
        let last = self.last_flushed_ms.load(Ordering::Relaxed);
        last == 0
            || now_ms().saturating_sub(last) > self.flush_check_interval.as_millis() as u64
    }

    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_accessed_ms.load(Ordering::Relaxed))
    }

    /// Idle beyond the death threshold; the owning loop exits.
    pub fn is_dead(&self) -> bool {
        self.idle_ms() > self.idle_death.as_millis() as u64
    }

    /// Idle beyond twice the death threshold; the supervisor's forced
    /// eviction trigger.
    pub fn time_to_kill(&self) -> bool {
        self.idle_ms() > 2 * self.idle_death.as_millis() as u64
    }

    /// Fully torn down: not processing and the socket is closed.
    pub fn shutdown_complete(&self) -> bool {
        !self.being_processed.load(Ordering::SeqCst) && self.socket_closed()
    }

    pub fn agent_uptime_secs(&self) -> u64 {
        self.agent_uptime_secs.load(Ordering::Relaxed)
    }

    pub fn pod_id(&self) -> String {
        self.pod.lock().unwrap().pod_id().to_string()
    }

    pub fn namespace(&self) -> String {
        self.pod.lock().unwrap().namespace().to_string()
    }

    pub fn pod_is_empty(&self) -> bool {
        self.pod.lock().unwrap().is_empty()
    }

    /// `screenName|address` once the pod is known, plain address before.
    pub fn display_name(&self) -> String {
        let pod = self.pod.lock().unwrap();
        if pod.is_empty() {
            self.address.clone()
        } else {
            format!("{}|{}", pod.screen_name(), self.address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(idle_death: Duration) -> ConnState {
        ConnState::with_thresholds(
            "127.0.0.1:9".to_string(),
            idle_death,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn fresh_connection_is_alive() {
        let s = state(Duration::from_secs(30));
        assert!(!s.is_dead());
        assert!(!s.time_to_kill());
        assert!(!s.shutdown_complete());
    }

    #[test]
    fn kill_threshold_is_twice_the_death_threshold() {
        let s = state(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        // idle > 0 ⇒ dead and killable with a zero threshold.
        assert!(s.is_dead());
        assert!(s.time_to_kill());

        s.accessed();
        assert!(s.idle_ms() <= 1);
    }

    #[test]
    fn shutdown_completes_only_with_socket_closed() {
        let s = state(Duration::from_secs(30));
        s.processed(true);
        s.request_shutdown();
        assert!(s.needs_shutdown());
        assert!(!s.shutdown_complete());

        s.processed(false);
        assert!(!s.shutdown_complete());

        s.mark_socket_closed();
        assert!(s.shutdown_complete());
    }

    #[test]
    fn flush_check_fires_when_never_flushed() {
        let s = state(Duration::from_secs(30));
        assert!(s.needs_flush_check());
        s.mark_flushed();
        assert!(!s.needs_flush_check());
    }

    #[test]
    fn display_name_switches_once_pod_is_known() {
        let s = state(Duration::from_secs(30));
        assert_eq!(s.display_name(), "127.0.0.1:9");

        s.pod
            .lock()
            .unwrap()
            .set_pod_name("esc-test-service-58dfcb97-n4f7w_1675853926859");
        assert_eq!(
            s.display_name(),
            "esc-test-service-58dfcb97-n4f7w_1675853926859|127.0.0.1:9"
        );
    }
}
