//! Stream types and stream registry records.

use serde::{Deserialize, Serialize};

use crate::pod::PodIdRestart;

/// The closed set of logical stream types an agent can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Params,
    Dictionary,
    Calls,
    Trace,
    Suspend,
    Sql,
    Xml,
    Top,
    Td,
    Heap,
    Gc,
}

impl StreamType {
    pub const ALL: [StreamType; 11] = [
        StreamType::Params,
        StreamType::Dictionary,
        StreamType::Calls,
        StreamType::Trace,
        StreamType::Suspend,
        StreamType::Sql,
        StreamType::Xml,
        StreamType::Top,
        StreamType::Td,
        StreamType::Heap,
        StreamType::Gc,
    ];

    /// Wire name, as sent by agents in `INIT_STREAM_V2`.
    pub fn name(self) -> &'static str {
        match self {
            StreamType::Params => "params",
            StreamType::Dictionary => "dictionary",
            StreamType::Calls => "calls",
            StreamType::Trace => "trace",
            StreamType::Suspend => "suspend",
            StreamType::Sql => "sql",
            StreamType::Xml => "xml",
            StreamType::Top => "top",
            StreamType::Td => "td",
            StreamType::Heap => "heap",
            StreamType::Gc => "gc",
        }
    }

    /// Case-insensitive lookup; `None` for unknown names.
    pub fn by_name(name: &str) -> Option<StreamType> {
        let lower = name.to_ascii_lowercase();
        StreamType::ALL.iter().copied().find(|s| s.name() == lower)
    }

    /// Whether this stream participates in time/size-based rotation.
    pub fn rotation_required(self) -> bool {
        !matches!(self, StreamType::Params | StreamType::Dictionary)
    }

    /// Metadata streams are decoded phrase-by-phrase, persisted with
    /// unlimited retention, and never compressed into size-rotated blobs.
    pub fn is_meta_stream(self) -> bool {
        matches!(
            self,
            StreamType::Params | StreamType::Dictionary | StreamType::Suspend
        )
    }

    /// File extension used when the stream is exported as a dump artifact.
    pub fn file_extension(self) -> &'static str {
        match self {
            StreamType::Sql => "sql",
            StreamType::Xml => "xml",
            StreamType::Top => "top.txt",
            StreamType::Td => "td.txt",
            StreamType::Heap => "hprof.zip",
            StreamType::Gc => "gc.log",
            _ => "",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle status of one rotation instance. Numeric values are part of
/// the persisted record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Created,
    Finished,
    Incorrect,
}

impl StreamStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            StreamStatus::Created => 0,
            StreamStatus::Finished => 9,
            StreamStatus::Incorrect => 11,
        }
    }

    pub fn from_i32(v: i32) -> StreamStatus {
        match v {
            0 => StreamStatus::Created,
            9 => StreamStatus::Finished,
            _ => StreamStatus::Incorrect,
        }
    }
}

/// Open request for one rotation instance of a (pod, stream type) stream.
#[derive(Debug, Clone)]
pub struct StreamInfoRequest {
    pub pod: PodIdRestart,
    pub stream: StreamType,
    pub requested_rolling_sequence_id: i32,
    pub reset_required: bool,
    /// Use the requested sequence id verbatim instead of resolving it
    /// against persisted state.
    pub force_requested_rolling_sequence_id: bool,
    pub created_ms: u64,
}

/// One rotation instance of a logical stream, as persisted.
///
/// `(created < rotation period && persisted_bytes == 0)` on a Finished
/// record is the indication that the connection was aborted mid-stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRegistry {
    pub pod: PodIdRestart,
    pub stream: StreamType,
    pub rolling_sequence_id: i32,
    pub created_ms: u64,
    pub modified_ms: u64,
    pub received_bytes: u64,
    pub persisted_bytes: u64,
    pub status: StreamStatus,
}

impl StreamRegistry {
    pub fn create(req: &StreamInfoRequest, seq_id: i32) -> Self {
        Self {
            pod: req.pod.clone(),
            stream: req.stream,
            rolling_sequence_id: seq_id,
            created_ms: req.created_ms,
            modified_ms: req.created_ms,
            received_bytes: 0,
            persisted_bytes: 0,
            status: StreamStatus::Created,
        }
    }

    pub fn received(&mut self, len: usize, now_ms: u64) {
        self.received_bytes += len as u64;
        self.modified_ms = now_ms;
    }

    pub fn persisted(&mut self, len: usize, now_ms: u64) {
        self.persisted_bytes += len as u64;
        self.modified_ms = now_ms;
    }

    /// Finished copy of this registry, stamped with the close time.
    pub fn close(&self, now_ms: u64) -> Self {
        Self {
            modified_ms: now_ms,
            status: StreamStatus::Finished,
            ..self.clone()
        }
    }

    pub fn is_meta_stream(&self) -> bool {
        self.stream.is_meta_stream()
    }

    pub fn screen_name(&self) -> String {
        format!(
            "{}|{}[{}]",
            self.pod.pod_id(),
            self.stream,
            self.rolling_sequence_id
        )
    }
}
