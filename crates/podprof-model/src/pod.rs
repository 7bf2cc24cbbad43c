//! Pod identity and per-pod activity accounting.
//!
//! A pod *incarnation* is identified by [`PodIdRestart`]: the parsed pod
//! name plus the restart timestamp embedded in the name the agent reports
//! (`esc-test-service-58dfcb97-n4f7w_1675853926859`). Two incarnations of
//! the same pod name with different restart timestamps are distinct.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::stream::{StreamInfoRequest, StreamType};

/// Tag key for the agent's reported protocol version.
pub const TAG_PROTOCOL: &str = "protocol";

/// Namespace / service / pod-name triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodName {
    pub namespace: String,
    pub service: String,
    pub pod_name: String,
}

impl PodName {
    pub fn empty() -> Self {
        Self {
            namespace: String::new(),
            service: String::new(),
            pod_name: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pod_name.is_empty()
    }
}

/// Stable key for one pod incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodIdRestart {
    pub name: PodName,
    /// Restart timestamp (epoch ms) parsed from the original pod name.
    pub restart_ms: u64,
}

impl PodIdRestart {
    pub fn empty() -> Self {
        Self {
            name: PodName::empty(),
            restart_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() || self.restart_ms == 0
    }

    /// Pod id without the restart timestamp.
    pub fn pod_id(&self) -> &str {
        &self.name.pod_name
    }

    pub fn namespace(&self) -> &str {
        &self.name.namespace
    }

    pub fn service(&self) -> &str {
        &self.name.service
    }

    /// `podName_restartEpochMillis`, the display and storage key form.
    pub fn screen_name(&self) -> String {
        format!("{}_{}", self.name.pod_name, self.restart_ms)
    }

    /// Parses an original agent pod name into a full identity (namespace
    /// left empty). `None` when the name does not carry the expected
    /// `name_epochmillis` shape.
    pub fn parse_original(original: &str) -> Option<Self> {
        let parsed = ParsedPodName::from_original(original)?;
        Some(Self {
            name: PodName {
                namespace: String::new(),
                service: parsed.service,
                pod_name: parsed.pod,
            },
            restart_ms: parsed.restart_ms,
        })
    }
}

impl std::fmt::Display for PodIdRestart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.screen_name())
    }
}

/// Service / pod / restart decomposition of an original agent pod name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPodName {
    pub service: String,
    pub pod: String,
    pub restart_ms: u64,
}

impl ParsedPodName {
    /// Format: `esc-test-service-58dfcb97-n4f7w_1675853926859` — the pod
    /// name proper, an underscore, and the restart epoch millis. The
    /// service name is the pod name with up to two trailing
    /// replica-set/pod hash segments stripped.
    pub fn from_original(original: &str) -> Option<Self> {
        let (pod, restart) = original.split_once('_')?;
        if pod.is_empty() || restart.contains('_') {
            return None;
        }
        let restart_ms: u64 = restart.parse().ok()?;
        if restart_ms == 0 {
            return None;
        }

        let segments: Vec<&str> = pod.split('-').collect();
        if segments.len() < 3 {
            return None;
        }
        Some(Self {
            service: strip_suffix_segments(&segments),
            pod: pod.to_string(),
            restart_ms,
        })
    }
}

/// Drops up to two trailing segments that look like generated hashes
/// (lowercase alphanumerics), keeping at least the leading segments.
fn strip_suffix_segments(segments: &[&str]) -> String {
    let mut keep = segments.len();
    for seg in segments.iter().rev().take(2) {
        if seg
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            keep -= 1;
        } else {
            break;
        }
    }
    segments[..keep].join("-")
}

/// Received/persisted byte pair for one stream type within one
/// accounting window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSize {
    pub received: u64,
    pub persisted: u64,
}

impl BlobSize {
    pub fn append(&mut self, original: bool, bytes: u64) {
        if original {
            self.received += bytes;
        } else {
            self.persisted += bytes;
        }
    }
}

/// Per-pod byte counters, keyed by stream type; reset each persistence
/// cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodDataAccumulated {
    pub map: HashMap<StreamType, BlobSize>,
}

impl PodDataAccumulated {
    pub fn append(&mut self, stream: StreamType, original: bool, bytes: u64) {
        self.map.entry(stream).or_default().append(original, bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn sum(&self, original: bool) -> u64 {
        self.map
            .values()
            .map(|b| if original { b.received } else { b.persisted })
            .sum()
    }
}

/// Live state of one connected pod.
///
/// Three phases: identity fields are filled in during the handshake
/// (possibly across the legacy two-command sequence), previously persisted
/// state is loaded on `init`, then counters and last-active advance with
/// every received command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatus {
    pub id: PodIdRestart,
    /// The pod name exactly as the agent sent it.
    pub original_pod_name: String,
    pub tags: HashMap<String, String>,
    pub active_since_ms: u64,
    pub last_active_ms: u64,
    pub accumulated: PodDataAccumulated,
}

impl PodStatus {
    pub fn empty(now_ms: u64) -> Self {
        Self {
            id: PodIdRestart::empty(),
            original_pod_name: String::new(),
            tags: HashMap::new(),
            active_since_ms: 0,
            last_active_ms: now_ms,
            accumulated: PodDataAccumulated::default(),
        }
    }

    // ── Handshake mutation ───────────────────────────────────────────

    pub fn set_namespace(&mut self, namespace: &str) {
        self.id.name.namespace = namespace.to_string();
    }

    pub fn set_microservice(&mut self, service: &str) {
        self.id.name.service = service.to_string();
    }

    /// Parses and installs the agent-reported pod name. An unparseable
    /// name is kept verbatim so the pod is still addressable, with a
    /// warning.
    pub fn set_pod_name(&mut self, original: &str) {
        match ParsedPodName::from_original(original) {
            Some(parsed) => {
                self.id.name.pod_name = parsed.pod;
                if self.id.name.service.is_empty() {
                    self.id.name.service = parsed.service;
                }
                self.id.restart_ms = parsed.restart_ms;
            }
            None => {
                warn!(pod = %original, "could not parse original pod name");
                self.id.name.pod_name = original.to_string();
            }
        }
        self.original_pod_name = original.to_string();
        self.active_since_ms = self.id.restart_ms;
    }

    pub fn set_client_protocol_version(&mut self, version: i64) {
        self.tags.insert(TAG_PROTOCOL.to_string(), version.to_string());
    }

    // ── Loading overrides ────────────────────────────────────────────

    pub fn override_active_since(&mut self, active_since_ms: u64) {
        self.active_since_ms = active_since_ms;
    }

    pub fn override_accumulated(&mut self, accumulated: PodDataAccumulated) {
        self.accumulated = accumulated;
    }

    // ── Working phase ────────────────────────────────────────────────

    pub fn new_stream_request(
        &self,
        now_ms: u64,
        stream: StreamType,
        requested_rolling_sequence_id: i32,
        reset_required: bool,
        force_requested_rolling_sequence_id: bool,
    ) -> StreamInfoRequest {
        StreamInfoRequest {
            pod: self.id.clone(),
            stream,
            requested_rolling_sequence_id,
            reset_required,
            force_requested_rolling_sequence_id,
            created_ms: now_ms,
        }
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_active_ms = now_ms;
    }

    /// Records received bytes. Metadata streams count as persisted
    /// immediately — their records go to the meta tables, never into
    /// compressed size-rotated blobs.
    pub fn received(&mut self, stream: StreamType, bytes: u64) {
        self.accumulated.append(stream, true, bytes);
        if stream.is_meta_stream() {
            self.persisted(stream, bytes);
        }
    }

    pub fn persisted(&mut self, stream: StreamType, bytes: u64) {
        self.accumulated.append(stream, false, bytes);
    }

    // ── Getters ──────────────────────────────────────────────────────

    pub fn is_empty(&self) -> bool {
        self.original_pod_name.is_empty()
    }

    pub fn is_updated_after(&self, since_ms: u64) -> bool {
        self.last_active_ms > since_ms
    }

    pub fn pod_id(&self) -> &str {
        self.id.pod_id()
    }

    pub fn namespace(&self) -> &str {
        self.id.namespace()
    }

    pub fn screen_name(&self) -> String {
        self.id.screen_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_original_pod_name() {
        let parsed =
            ParsedPodName::from_original("esc-test-service-58dfcb97-n4f7w_1675853926859").unwrap();
        assert_eq!(parsed.service, "esc-test-service");
        assert_eq!(parsed.pod, "esc-test-service-58dfcb97-n4f7w");
        assert_eq!(parsed.restart_ms, 1_675_853_926_859);
    }

    #[test]
    fn rejects_malformed_pod_names() {
        assert!(ParsedPodName::from_original("no-underscore").is_none());
        assert!(ParsedPodName::from_original("pod_notanumber").is_none());
        assert!(ParsedPodName::from_original("too-few_1675853926859").is_none());
        assert!(ParsedPodName::from_original("pod_0").is_none());
    }

    #[test]
    fn same_pod_different_restart_is_distinct() {
        let a = PodIdRestart::parse_original("svc-a-58dfcb97-n4f7w_1000").unwrap();
        let b = PodIdRestart::parse_original("svc-a-58dfcb97-n4f7w_2000").unwrap();
        assert_eq!(a.pod_id(), b.pod_id());
        assert_ne!(a, b);
        assert_eq!(a.screen_name(), "svc-a-58dfcb97-n4f7w_1000");
    }

    #[test]
    fn meta_stream_receipt_counts_as_persisted() {
        let mut pod = PodStatus::empty(1_000);
        pod.received(StreamType::Dictionary, 64);
        pod.received(StreamType::Calls, 128);

        let dict = pod.accumulated.map[&StreamType::Dictionary];
        assert_eq!(dict.received, 64);
        assert_eq!(dict.persisted, 64);

        let calls = pod.accumulated.map[&StreamType::Calls];
        assert_eq!(calls.received, 128);
        assert_eq!(calls.persisted, 0);
    }

    #[test]
    fn handshake_fills_identity_progressively() {
        let mut pod = PodStatus::empty(1_000);
        assert!(pod.is_empty());

        pod.set_namespace("prod");
        pod.set_microservice("esc-test-service");
        pod.set_pod_name("esc-test-service-58dfcb97-n4f7w_1675853926859");

        assert!(!pod.is_empty());
        assert_eq!(pod.namespace(), "prod");
        assert_eq!(pod.id.name.service, "esc-test-service");
        assert_eq!(pod.pod_id(), "esc-test-service-58dfcb97-n4f7w");
        assert_eq!(pod.active_since_ms, 1_675_853_926_859);
    }
}
