//! One task per agent connection.
//!
//! The task configures the socket, performs the handshake (with the
//! legacy two-step fallback), registers with the supervisor, then loops:
//! while not dead, dispatch one command when one is ready, otherwise
//! sleep briefly. Every exit path releases served stream handles and
//! closes the socket; the supervisor's forced kill only raises the
//! shutdown flag, which the loop observes within one poll interval, so
//! self-termination and forced eviction never race on the socket itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

use podprof_model::CollectorConfig;
use podprof_wire::consts::{COMMAND_POLL_INTERVAL, FLUSH_CHECK_INTERVAL};
use podprof_wire::{FieldReader, FieldWriter, WireError};

use crate::error::CollectorError;
use crate::metrics::CollectorMetrics;
use crate::pods::PodTracker;
use crate::streams::hub::StreamHub;
use crate::tcp::reader::{AgentReader, Flow};
use crate::tcp::state::ConnState;
use crate::tcp::supervisor::Supervisor;

/// Shared collaborators handed to every connection task.
pub struct ConnectionDeps {
    pub config: Arc<CollectorConfig>,
    pub hub: Arc<StreamHub>,
    pub pods: Arc<PodTracker>,
    pub metrics: Arc<CollectorMetrics>,
}

/// Supervisor-side handle to one live connection.
pub struct AgentConnection {
    state: Arc<ConnState>,
}

impl AgentConnection {
    pub fn new(state: Arc<ConnState>) -> Self {
        Self { state }
    }

    pub fn pod_id(&self) -> String {
        self.state.pod_id()
    }

    pub fn namespace(&self) -> String {
        self.state.namespace()
    }

    pub fn display_name(&self) -> String {
        self.state.display_name()
    }

    pub fn time_to_kill(&self) -> bool {
        self.state.time_to_kill()
    }

    pub fn shutdown_complete(&self) -> bool {
        self.state.shutdown_complete()
    }

    /// Asks the owning task to close; observed within one poll interval.
    pub fn kill(&self, reason: &str) {
        info!(
            conn = %self.state.display_name(),
            reason,
            idle_ms = self.state.idle_ms(),
            "closing connection"
        );
        self.state.request_shutdown();
    }

    #[cfg(test)]
    pub(crate) fn state_for_test(&self) -> Arc<ConnState> {
        self.state.clone()
    }
}

/// Spawns the per-connection task for an accepted socket.
pub fn spawn(
    stream: TcpStream,
    peer: SocketAddr,
    deps: Arc<ConnectionDeps>,
    supervisor: Arc<Supervisor>,
) {
    tokio::spawn(async move {
        handle_connection(stream, peer, deps, supervisor).await;
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    deps: Arc<ConnectionDeps>,
    supervisor: Arc<Supervisor>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not set nodelay");
    }

    let (read_half, write_half) = stream.into_split();
    let state = Arc::new(ConnState::with_thresholds(
        peer.to_string(),
        deps.config.idle_death(),
        FLUSH_CHECK_INTERVAL,
        deps.config.socket_read_timeout() / 2,
    ));
    let mut reader = AgentReader::new(
        deps.hub.clone(),
        deps.pods.clone(),
        deps.metrics.clone(),
        FieldReader::with_timeout(read_half, deps.config.socket_read_timeout()),
        FieldWriter::new(write_half),
        state.clone(),
    );

    debug!(%peer, "connection task started, waiting for first command");
    match reader.first_action().await {
        Ok(Flow::Continue) => {
            info!(conn = %state.display_name(), "agent connection registered");
            supervisor.add_connection(AgentConnection::new(state.clone()));
            run_loop(&mut reader, &state).await;
        }
        Ok(Flow::Close(reason)) => {
            info!(conn = %state.display_name(), reason, "connection closed during handshake");
        }
        Err(e) => {
            error!(conn = %state.display_name(), error = %e, "failed to initialize connection");
        }
    }

    reader.done();
    reader.close_streams();
    reader.shutdown_output().await;
    state.mark_socket_closed();
    info!(
        conn = %state.display_name(),
        idle_ms = state.idle_ms(),
        "connection closed"
    );
}

async fn run_loop(
    reader: &mut AgentReader<OwnedReadHalf, OwnedWriteHalf>,
    state: &Arc<ConnState>,
) {
    loop {
        if state.is_dead() {
            debug!(conn = %state.display_name(), "idle beyond death threshold");
            break;
        }

        let available = command_available(reader.input_ref()).await;
        if !(available || state.needs_shutdown() || state.needs_flush_check()) {
            sleep(COMMAND_POLL_INTERVAL).await;
            continue;
        }

        match reader.next_action(available).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close(reason)) => {
                info!(
                    conn = %state.display_name(),
                    reason,
                    idle_ms = state.idle_ms(),
                    "closing connection"
                );
                break;
            }
            Err(CollectorError::Wire(WireError::Timeout)) => {
                error!(conn = %state.display_name(), "client dropped by timeout");
                state.request_shutdown();
                break;
            }
            Err(CollectorError::Wire(e)) => {
                error!(conn = %state.display_name(), error = %e, "socket error");
                state.request_shutdown();
                break;
            }
            Err(e) => {
                error!(
                    conn = %state.display_name(),
                    error = %e,
                    "exception when processing command, will close the socket"
                );
                state.request_shutdown();
                break;
            }
        }
    }
}

/// Non-blocking readiness probe: true when command bytes (or an EOF) are
/// waiting on the socket.
async fn command_available(half: &OwnedReadHalf) -> bool {
    match timeout(Duration::ZERO, half.ready(Interest::READABLE)).await {
        Ok(Ok(ready)) => ready.is_readable() || ready.is_read_closed(),
        _ => false,
    }
}
