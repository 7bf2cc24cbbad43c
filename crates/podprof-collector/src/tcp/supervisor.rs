//! Connection pool supervisor.
//!
//! Holds the set of live connections, force-kills any that sat idle past
//! the kill threshold (remove first, then kill — a connection is only
//! ever killed once), and resolves pod-id collisions: a pod reconnecting
//! without a clean close gets its previous connection force-closed.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use podprof_wire::consts::SUPERVISOR_SCAN_INTERVAL;

use crate::tcp::connection::AgentConnection;

/// Supervises every live agent connection.
#[derive(Default)]
pub struct Supervisor {
    connections: Mutex<Vec<AgentConnection>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, force-closing any previous connection for
    /// the same pod id first.
    pub fn add_connection(&self, connection: AgentConnection) {
        let pod_id = connection.pod_id();
        let mut connections = self.connections.lock().unwrap();

        if !pod_id.is_empty() {
            connections.retain(|existing| {
                if existing.pod_id() == pod_id {
                    // The old pod is guaranteed to have finished writing;
                    // free its resources for the new connection.
                    warn!(
                        conn = %existing.display_name(),
                        "pod reconnected, closing previous connection"
                    );
                    existing.kill("new pod connected");
                    false
                } else {
                    true
                }
            });
        }

        debug!(conn = %connection.display_name(), "connection added to the pool");
        connections.push(connection);
    }

    /// Live connection count (gauge).
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Live connection count per namespace (gauge).
    pub fn counts_by_namespace(&self) -> HashMap<String, usize> {
        let connections = self.connections.lock().unwrap();
        let mut counts = HashMap::new();
        for connection in connections.iter() {
            *counts.entry(connection.namespace()).or_insert(0) += 1;
        }
        counts
    }

    /// One eviction pass: drop every connection past its kill threshold.
    pub fn scan(&self) {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|connection| {
            if !connection.time_to_kill() {
                return true;
            }
            debug!(
                conn = %connection.display_name(),
                "removing idle connection from the pool"
            );
            if !connection.shutdown_complete() {
                connection.kill("idle beyond kill threshold");
            }
            false
        });
    }

    /// Eviction loop; exits when the shutdown channel fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("supervisor started");
        let mut ticker = tokio::time::interval(SUPERVISOR_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan(),
                _ = shutdown.changed() => break,
            }
        }
        info!("supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::tcp::state::ConnState;

    fn connection(pod_name: Option<&str>, idle_death: Duration) -> AgentConnection {
        let state = Arc::new(ConnState::with_thresholds(
            "127.0.0.1:9".to_string(),
            idle_death,
            Duration::from_millis(10),
            Duration::from_millis(50),
        ));
        if let Some(name) = pod_name {
            let mut pod = state.pod.lock().unwrap();
            pod.set_namespace("prod");
            pod.set_pod_name(name);
        }
        AgentConnection::new(state)
    }

    #[test]
    fn idle_connection_is_removed_exactly_once() {
        let supervisor = Supervisor::new();
        supervisor.add_connection(connection(None, Duration::from_millis(0)));
        assert_eq!(supervisor.connection_count(), 1);

        std::thread::sleep(Duration::from_millis(2));
        supervisor.scan();
        assert_eq!(supervisor.connection_count(), 0);

        // A second pass over the empty pool is a no-op.
        supervisor.scan();
        assert_eq!(supervisor.connection_count(), 0);
    }

    #[test]
    fn pod_collision_closes_exactly_the_old_connection() {
        let supervisor = Supervisor::new();
        let old = connection(
            Some("esc-test-service-58dfcb97-n4f7w_1675853926859"),
            Duration::from_secs(30),
        );
        let unrelated = connection(
            Some("other-service-7f9c1b22-x2k8q_1675853926900"),
            Duration::from_secs(30),
        );
        let old_state = old.state_for_test();
        let unrelated_state = unrelated.state_for_test();

        supervisor.add_connection(old);
        supervisor.add_connection(unrelated);

        // Same pod id, new restart timestamp.
        supervisor.add_connection(connection(
            Some("esc-test-service-58dfcb97-n4f7w_1675853990000"),
            Duration::from_secs(30),
        ));

        assert_eq!(supervisor.connection_count(), 2);
        assert!(old_state.needs_shutdown());
        assert!(!unrelated_state.needs_shutdown());
    }

    #[test]
    fn connections_without_identity_do_not_collide() {
        let supervisor = Supervisor::new();
        supervisor.add_connection(connection(None, Duration::from_secs(30)));
        supervisor.add_connection(connection(None, Duration::from_secs(30)));
        assert_eq!(supervisor.connection_count(), 2);
    }

    #[test]
    fn namespace_counts_follow_the_pool() {
        let supervisor = Supervisor::new();
        supervisor.add_connection(connection(
            Some("esc-test-service-58dfcb97-n4f7w_1675853926859"),
            Duration::from_secs(30),
        ));
        supervisor.add_connection(connection(
            Some("other-service-7f9c1b22-x2k8q_1675853926900"),
            Duration::from_secs(30),
        ));

        let counts = supervisor.counts_by_namespace();
        assert_eq!(counts.get("prod"), Some(&2));
    }
}
