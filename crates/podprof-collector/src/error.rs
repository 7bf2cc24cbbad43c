//! Collector error taxonomy.

use thiserror::Error;
use uuid::Uuid;

use podprof_persist::PersistError;
use podprof_wire::WireError;

/// Result type alias for collector operations.
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Errors raised by the ingestion engine.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A data command referenced a handle with no open sink. Fatal for
    /// the connection: the agent must reconnect and re-init the stream.
    #[error("stream {0} is not initialized")]
    StreamNotInitialized(Uuid),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("protocol error: {0}")]
    Protocol(String),
}
