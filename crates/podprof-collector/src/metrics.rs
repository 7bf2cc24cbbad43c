//! Collector metrics — connection gauges and received-byte counters.
//!
//! Counters use atomics on the hot path; the per-namespace map takes a
//! short mutex. [`render_prometheus`] produces text exposition for an
//! external scrape surface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::tcp::supervisor::Supervisor;

/// Byte counters for data received from agents.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    received_bytes_total: AtomicU64,
    received_bytes_by_namespace: Mutex<HashMap<String, u64>>,
}

impl CollectorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one data command's payload size.
    pub fn record_received(&self, namespace: &str, bytes: usize) {
        self.received_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
        let mut by_ns = self.received_bytes_by_namespace.lock().unwrap();
        *by_ns.entry(namespace.to_string()).or_insert(0) += bytes as u64;
    }

    pub fn received_bytes_total(&self) -> u64 {
        self.received_bytes_total.load(Ordering::Relaxed)
    }

    pub fn received_bytes_by_namespace(&self) -> HashMap<String, u64> {
        self.received_bytes_by_namespace.lock().unwrap().clone()
    }
}

/// Renders connection gauges and byte counters in Prometheus text format.
pub fn render_prometheus(metrics: &CollectorMetrics, supervisor: &Supervisor) -> String {
    let mut out = String::new();

    out.push_str("# HELP podprof_connected_agents Number of agents connected to the collector.\n");
    out.push_str("# TYPE podprof_connected_agents gauge\n");
    out.push_str(&format!(
        "podprof_connected_agents {}\n",
        supervisor.connection_count()
    ));

    out.push_str(
        "# HELP podprof_connected_agents_namespace Connected agents per namespace.\n",
    );
    out.push_str("# TYPE podprof_connected_agents_namespace gauge\n");
    let mut by_ns: Vec<(String, usize)> = supervisor.counts_by_namespace().into_iter().collect();
    by_ns.sort();
    for (namespace, count) in by_ns {
        out.push_str(&format!(
            "podprof_connected_agents_namespace{{namespace=\"{namespace}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP podprof_received_bytes_total Bytes received from agents.\n");
    out.push_str("# TYPE podprof_received_bytes_total counter\n");
    out.push_str(&format!(
        "podprof_received_bytes_total {}\n",
        metrics.received_bytes_total()
    ));

    out.push_str(
        "# HELP podprof_received_bytes_namespace_total Bytes received per namespace.\n",
    );
    out.push_str("# TYPE podprof_received_bytes_namespace_total counter\n");
    let mut received: Vec<(String, u64)> =
        metrics.received_bytes_by_namespace().into_iter().collect();
    received.sort();
    for (namespace, bytes) in received {
        out.push_str(&format!(
            "podprof_received_bytes_namespace_total{{namespace=\"{namespace}\"}} {bytes}\n"
        ));
    }

    out
}
