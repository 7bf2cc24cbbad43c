//! Collector configuration (TOML).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::StreamType;

/// Tunable limits for the collector endpoint.
///
/// All durations are milliseconds in the file; accessor methods expose
/// derived values the way the subsystems consume them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// TCP port the agent acceptor binds.
    pub listen_port: u16,
    /// Expected number of agents streaming heavily at any time.
    pub num_heavy_clients: usize,
    /// Expected number of mostly-idle connected agents.
    pub num_idle_clients: usize,
    /// Retention period for pod activity records (default 2 weeks).
    pub retention_period_ms: u64,
    /// Per-pod stored data cap, in KiB (default 200 MiB).
    pub log_max_size_kb: u64,
    /// Buffered sink chunk size in bytes before a chunk is persisted.
    pub stream_chunk_size: usize,
    /// Explicit rotation period for rotating streams; 0 derives one from
    /// the retention period.
    pub stream_rotation_period_ms: u64,
    /// Pod statistics flush interval.
    pub stat_persist_interval_ms: u64,
    /// Idle time after which a connection is considered dead; forced kill
    /// happens at twice this value.
    pub idle_death_ms: u64,
    /// Per-field socket read deadline.
    pub socket_read_timeout_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_port: 4715,
            num_heavy_clients: 100,
            num_idle_clients: 1000,
            retention_period_ms: 1_209_600_000,
            log_max_size_kb: 204_800,
            stream_chunk_size: 3072,
            stream_rotation_period_ms: 300_000,
            stat_persist_interval_ms: 60_000,
            idle_death_ms: 30_000,
            socket_read_timeout_ms: 10_000,
        }
    }
}

impl CollectorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CollectorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn max_connections(&self) -> usize {
        (self.num_heavy_clients + self.num_idle_clients) * 2
    }

    pub fn max_open_streams(&self) -> usize {
        (self.num_heavy_clients + self.num_idle_clients) * StreamType::ALL.len()
    }

    pub fn log_max_size(&self) -> u64 {
        self.log_max_size_kb * 1024
    }

    /// Rotation period for a stream type, in milliseconds; 0 for types
    /// that do not rotate. Without an explicit setting, rotate at least
    /// hourly and at least three times per retention period.
    pub fn rotation_period(&self, stream: StreamType) -> i64 {
        if !stream.rotation_required() {
            return 0;
        }
        if self.stream_rotation_period_ms > 0 {
            return self.stream_rotation_period_ms as i64;
        }
        (self.retention_period_ms / 3).min(3_600_000) as i64
    }

    /// Size threshold that triggers rotation, in bytes; 0 for types that
    /// do not rotate. At least ten rotations per size cap, capped at 2 MiB.
    pub fn required_rotation_size(&self, stream: StreamType) -> i64 {
        if !stream.rotation_required() {
            return 0;
        }
        (self.log_max_size() / 10).min(2_097_152) as i64
    }

    pub fn socket_read_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_read_timeout_ms)
    }

    pub fn idle_death(&self) -> Duration {
        Duration::from_millis(self.idle_death_ms)
    }

    pub fn stat_persist_interval(&self) -> Duration {
        Duration::from_millis(self.stat_persist_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_sane_limits() {
        let config = CollectorConfig::default();
        assert_eq!(config.max_connections(), 2200);
        assert_eq!(config.max_open_streams(), 1100 * 11);
        assert_eq!(config.log_max_size(), 209_715_200);
    }

    #[test]
    fn non_rotating_streams_report_zero_thresholds() {
        let config = CollectorConfig::default();
        assert_eq!(config.rotation_period(StreamType::Params), 0);
        assert_eq!(config.required_rotation_size(StreamType::Dictionary), 0);
        assert!(config.rotation_period(StreamType::Calls) > 0);
    }

    #[test]
    fn rotation_period_falls_back_to_retention_derived() {
        let config = CollectorConfig {
            stream_rotation_period_ms: 0,
            ..Default::default()
        };
        // Bounded by the hourly cap.
        assert_eq!(config.rotation_period(StreamType::Calls), 3_600_000);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let parsed: CollectorConfig =
            toml::from_str("listen_port = 9999\nnum_heavy_clients = 5").unwrap();
        assert_eq!(parsed.listen_port, 9999);
        assert_eq!(parsed.num_heavy_clients, 5);
        assert_eq!(parsed.stream_chunk_size, 3072);
    }
}
