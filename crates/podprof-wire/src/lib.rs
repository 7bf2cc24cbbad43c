//! podprof-wire — primitives of the agent wire protocol.
//!
//! The agent protocol is a hand-rolled big-endian binary protocol: one
//! command-id byte per message, followed by a command-specific sequence of
//! typed fields. Stream payloads carried by `RCV_DATA` are themselves framed
//! into *phrases* (4-byte length prefix + payload).
//!
//! # Layers
//!
//! ```text
//! TcpStream
//!   └── FieldReader / FieldWriter   typed fields (u8, i32, i64, UUID,
//!       (fields.rs)                 length-prefixed strings/blobs)
//!         └── PhraseBuffer          reframes RCV_DATA payload bytes into
//!             (phrase.rs)           discrete length-prefixed phrases
//! ```
//!
//! This crate is transport-shaped only: it knows nothing about stream
//! semantics, rotation, or persistence.

pub mod consts;
pub mod error;
pub mod fields;
pub mod phrase;

pub use error::{WireError, WireResult};
pub use fields::{FieldReader, FieldWriter};
pub use phrase::PhraseBuffer;
