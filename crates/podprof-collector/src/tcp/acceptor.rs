//! Agent connection acceptor.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::tcp::connection::{self, ConnectionDeps};
use crate::tcp::supervisor::Supervisor;

/// Binds the agent listening socket.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "listening for agent connections");
    Ok(listener)
}

/// Accept loop: constructs one connection task per accepted socket and
/// registers it with the supervisor. Accept errors are logged, the socket
/// dropped, and the loop continues.
pub async fn run(
    listener: TcpListener,
    deps: Arc<ConnectionDeps>,
    supervisor: Arc<Supervisor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "received agent connection");
                    connection::spawn(stream, peer, deps.clone(), supervisor.clone());
                }
                Err(e) => {
                    error!(error = %e, "exception when accepting connection");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("acceptor stopped");
}
