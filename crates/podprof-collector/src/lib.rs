//! podprof-collector — the agent ingestion protocol and stream-lifecycle
//! engine.
//!
//! Profiling agents hold one long-lived TCP connection each and stream
//! several classes of binary data (call traces, dictionary/parameter
//! metadata, GC-suspend logs, heap/thread dumps). This crate owns the
//! receiving side end to end:
//!
//! ```text
//! acceptor ──► connection task (one per socket)
//!                └── AgentReader        command dispatch state machine
//!                      ├── StreamHub    handle → sink, rotation, cleanup
//!                      │     ├── ParsedSink   metadata phrase decoding
//!                      │     └── ChunkSink    buffered chunk persistence
//!                      └── PodTracker   per-pod activity + counters
//! supervisor ──► idle eviction, pod-collision resolution, gauges
//! ```
//!
//! Everything downstream of the [`podprof_persist::Persistence`] trait —
//! durable storage, registries, the query/UI surface — is a collaborator,
//! not part of this crate.

pub mod decode;
pub mod error;
pub mod metrics;
pub mod pods;
pub mod streams;
pub mod tcp;

pub use error::{CollectorError, CollectorResult};
pub use metrics::CollectorMetrics;
pub use pods::PodTracker;
pub use streams::hub::StreamHub;
pub use tcp::supervisor::Supervisor;
