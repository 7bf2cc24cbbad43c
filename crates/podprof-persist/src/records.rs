//! Record types crossing the persistence seam.

use serde::{Deserialize, Serialize};

use podprof_model::{PodDataAccumulated, PodIdRestart, StreamType};

/// One buffered slice of a stream's byte payload, keyed by its rotation
/// instance and running start offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub pod: PodIdRestart,
    pub stream: StreamType,
    pub rolling_sequence_id: i32,
    /// Byte offset of this chunk within the rotation instance.
    pub start_pos: u64,
    /// Whether the payload is stored compressed at rest. Heap dumps
    /// arrive pre-compressed by the agent and are stored as-is.
    pub compressed: bool,
    pub data: Vec<u8>,
}

/// Decoded dictionary entry: one tag at a running position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryRecord {
    pub pod: PodIdRestart,
    pub position: i32,
    pub tag: String,
}

/// Decoded call-parameter definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub pod: PodIdRestart,
    pub name: String,
    pub indexed: bool,
    pub list: bool,
    pub order: i32,
    pub signature: String,
}

/// Decoded GC-suspension hickup: the moment and length of one pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendRecord {
    pub pod: PodIdRestart,
    pub time_ms: u64,
    /// Milliseconds since the previous hickup.
    pub delta_ms: i64,
    /// Length of the suspension in milliseconds.
    pub suspended_ms: i64,
}

/// A drained batch of decoded metadata records, saved in one bulk
/// operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaBatch {
    Dictionary(Vec<DictionaryRecord>),
    Params(Vec<ParamRecord>),
    Suspend(Vec<SuspendRecord>),
}

impl MetaBatch {
    pub fn len(&self) -> usize {
        match self {
            MetaBatch::Dictionary(v) => v.len(),
            MetaBatch::Params(v) => v.len(),
            MetaBatch::Suspend(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Previously persisted pod state returned by
/// [`crate::Persistence::initialize_pod`] for a reconnecting pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodInit {
    pub active_since_ms: Option<u64>,
    pub accumulated: Option<PodDataAccumulated>,
}
