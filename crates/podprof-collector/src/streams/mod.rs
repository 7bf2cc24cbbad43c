//! Stream sinks and the registry/rotation engine.
//!
//! Every open rotation instance of a (pod, stream type) stream is served
//! by one sink, selected by stream type at open time:
//!
//! - metadata streams (params/dictionary/suspend) → [`parsed::ParsedSink`]
//!   (phrase reframing + decoding + bulk record persistence);
//! - heap dumps → uncompressed [`sink::ChunkSink`] (the agent already
//!   compressed them);
//! - everything else → compressed [`sink::ChunkSink`].
//!
//! [`hub::StreamHub`] owns the handle → sink map, rotation, and cleanup.

pub mod hub;
pub mod parsed;
pub mod sink;

pub use hub::{StreamHub, StreamOpened};
pub use sink::StreamSink;
