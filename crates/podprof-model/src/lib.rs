//! podprof-model — domain types for the podprof collector.
//!
//! Pod identities, stream types, stream registry records, per-pod activity
//! counters, and the collector configuration. All persisted types are
//! serde-serializable; storage adapters decide the actual encoding.

pub mod config;
pub mod pod;
pub mod stream;
pub mod time;

pub use config::CollectorConfig;
pub use pod::{BlobSize, PodDataAccumulated, PodIdRestart, PodName, PodStatus};
pub use stream::{StreamInfoRequest, StreamRegistry, StreamStatus, StreamType};
