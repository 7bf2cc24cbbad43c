//! Connection lifecycle: state, protocol dispatch, per-socket tasks,
//! accept loop, and the supervising eviction scan.

pub mod acceptor;
pub mod connection;
pub mod reader;
pub mod state;
pub mod supervisor;

pub use connection::{AgentConnection, ConnectionDeps};
pub use state::ConnState;
pub use supervisor::Supervisor;
