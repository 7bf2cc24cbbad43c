//! podprof-persist — the persistence seam of the collector.
//!
//! The collector core never talks to a database directly; it hands
//! batch-shaped operations to a [`Persistence`] implementation. Durable
//! adapters (SQL, object storage) live elsewhere and implement the same
//! trait; [`memory::InMemoryPersistence`] backs tests and standalone runs.

pub mod error;
pub mod memory;
pub mod records;
pub mod service;

pub use error::{PersistError, PersistResult};
pub use memory::InMemoryPersistence;
pub use records::{
    DictionaryRecord, MetaBatch, ParamRecord, PodInit, StreamChunk, SuspendRecord,
};
pub use service::{Persistence, SharedPersistence};
