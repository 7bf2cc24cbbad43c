//! The command dispatch state machine.
//!
//! One reader per connection, driven strictly sequentially by the owning
//! connection task: read one command byte, read that command's fixed field
//! sequence, dispatch to the stream hub / pod tracker, write the response.
//!
//! Output flushing: request/response commands flush immediately so the
//! agent sees synchronous replies; data commands flush only once the
//! batching window elapsed.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use podprof_model::StreamType;
use podprof_model::time::now_ms;
use podprof_wire::consts::{
    ACK_ERROR_MAGIC, ACK_OK, COMMAND_CLOSE, COMMAND_GET_PROTOCOL_VERSION,
    COMMAND_GET_PROTOCOL_VERSION_V2, COMMAND_INIT_STREAM, COMMAND_INIT_STREAM_V2,
    COMMAND_RCV_DATA, COMMAND_REPORT_COMMAND_RESULT, COMMAND_REQUEST_ACK_FLUSH, COMMAND_SUCCESS,
    PROTOCOL_VERSION, PROTOCOL_VERSION_V2,
};
use podprof_wire::{FieldReader, FieldWriter, WireError};

use crate::error::{CollectorError, CollectorResult};
use crate::metrics::CollectorMetrics;
use crate::pods::PodTracker;
use crate::streams::hub::StreamHub;
use crate::tcp::state::ConnState;

/// What the connection loop should do after a reader step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Close the connection, with the reason for the log line.
    Close(&'static str),
}

/// Protocol reader for one agent connection.
pub struct AgentReader<R, W> {
    hub: Arc<StreamHub>,
    pods: Arc<PodTracker>,
    metrics: Arc<CollectorMetrics>,
    input: FieldReader<R>,
    output: FieldWriter<W>,
    state: Arc<ConnState>,
    /// Handles this connection has received data for; released on close.
    served: HashSet<Uuid>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AgentReader<R, W> {
    pub fn new(
        hub: Arc<StreamHub>,
        pods: Arc<PodTracker>,
        metrics: Arc<CollectorMetrics>,
        input: FieldReader<R>,
        output: FieldWriter<W>,
        state: Arc<ConnState>,
    ) -> Self {
        Self {
            hub,
            pods,
            metrics,
            input,
            output,
            state,
            served: HashSet::new(),
        }
    }

    pub fn state(&self) -> &Arc<ConnState> {
        &self.state
    }

    pub fn input_ref(&self) -> &R {
        self.input.inner_ref()
    }

    /// The handshake: process one command; the first command normally
    /// carries the pod identity. Older agents send the legacy version
    /// command first, so if the identity is still empty the companion
    /// command is consumed synchronously before control returns.
    pub async fn first_action(&mut self) -> CollectorResult<Flow> {
        debug!(conn = %self.state.display_name(), "processing first command");
        let mut flow = self.process_command().await?;
        if flow == Flow::Continue && self.state.pod_is_empty() {
            warn!(
                conn = %self.state.display_name(),
                "older client? processing second command for initialization"
            );
            flow = self.process_command().await?;
        }
        self.state.processed(true);
        Ok(flow)
    }

    /// One loop step: dispatch a command if one is ready, then give
    /// buffered stream output its periodic flush chance.
    pub async fn next_action(&mut self, command_ready: bool) -> CollectorResult<Flow> {
        if self.state.needs_shutdown() {
            return Ok(Flow::Close("shutdown"));
        }

        let mut flow = Flow::Continue;
        if command_ready {
            flow = self.process_command().await?;
        }
        if flow == Flow::Continue && self.state.needs_flush_check() {
            self.flush_streams();
        }
        Ok(flow)
    }

    async fn process_command(&mut self) -> CollectorResult<Flow> {
        let command = match self.input.read_u8().await {
            Ok(c) => c,
            // Orderly EOF where a command byte was expected is protocol
            // corruption, not a plain socket failure.
            Err(WireError::Eof) => {
                return Err(CollectorError::Protocol("end of input".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        self.state.accessed();
        trace!(conn = %self.state.display_name(), command, "received command");

        match command {
            COMMAND_INIT_STREAM => {
                // Legacy: the identity strings precede the regular
                // INIT_STREAM_V2 body.
                let namespace = self.input.read_string().await?;
                let microservice = self.input.read_string().await?;
                let pod_name = self.input.read_string().await?;
                {
                    let mut pod = self.state.pod.lock().unwrap();
                    pod.set_namespace(&namespace);
                    pod.set_microservice(&microservice);
                    pod.set_pod_name(&pod_name);
                }
                self.cmd_init_stream_v2().await
            }

            COMMAND_INIT_STREAM_V2 => self.cmd_init_stream_v2().await,

            COMMAND_RCV_DATA => self.cmd_rcv_data().await,

            COMMAND_CLOSE => Ok(Flow::Close("requested")),

            COMMAND_GET_PROTOCOL_VERSION => {
                self.output.write_i64(PROTOCOL_VERSION);
                self.flush_output(true).await?;
                Ok(Flow::Continue)
            }

            COMMAND_GET_PROTOCOL_VERSION_V2 => self.cmd_get_protocol_version_v2().await,

            COMMAND_REQUEST_ACK_FLUSH => {
                let pod_id = {
                    let mut pod = self.state.pod.lock().unwrap();
                    pod.touch(now_ms());
                    pod.id.clone()
                };
                self.pods.touch(&pod_id);
                self.output.write_u8(ACK_OK);
                self.flush_output(true).await?;
                Ok(Flow::Continue)
            }

            COMMAND_REPORT_COMMAND_RESULT => {
                let executed = self.input.read_uuid().await?;
                let success = self.input.read_u8().await?;
                warn!(
                    conn = %self.state.display_name(),
                    command_id = ?executed,
                    success = success == COMMAND_SUCCESS,
                    "deprecated command result report"
                );
                Ok(Flow::Continue)
            }

            other => Err(CollectorError::Protocol(format!(
                "unknown command {other} received from {}",
                self.state.display_name()
            ))),
        }
    }

    async fn cmd_init_stream_v2(&mut self) -> CollectorResult<Flow> {
        let stream_name = self.input.read_string().await?;
        let requested_rolling_sequence_id = self.input.read_i32().await?;
        let reset_required = self.input.read_i32().await?;

        let Some(stream) = StreamType::by_name(&stream_name) else {
            error!(
                conn = %self.state.display_name(),
                stream = %stream_name,
                "invalid stream type"
            );
            self.output.write_uuid(None);
            self.flush_output(true).await?;
            return Ok(Flow::Continue);
        };

        let rotation_period = self.hub.rotation_period(stream);
        let required_rotation_size = self.hub.required_rotation_size(stream);
        let request = self.state.pod.lock().unwrap().new_stream_request(
            now_ms(),
            stream,
            requested_rolling_sequence_id,
            reset_required > 0,
            false,
        );

        match self.hub.stream_opened(&request) {
            Ok(opened) => {
                for handle in &opened.cleaned_up {
                    self.served.remove(handle);
                }
                self.output.write_uuid(Some(opened.handle));
                self.output.write_i64(rotation_period);
                self.output.write_i64(required_rotation_size);
                self.output.write_i32(opened.rolling_sequence_id);
            }
            Err(e) => {
                // A failed open is a soft failure; the agent retries.
                error!(
                    conn = %self.state.display_name(),
                    stream = %stream,
                    error = %e,
                    "exception when initializing stream"
                );
                self.output.write_uuid(None);
            }
        }
        self.flush_output(true).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_rcv_data(&mut self) -> CollectorResult<Flow> {
        let handle = self.input.read_uuid().await?;

        let content_length;
        let result = {
            let data = self.input.read_field().await?;
            content_length = data.len();
            match handle {
                Some(handle) => self.hub.receive(handle, data),
                None => Err(CollectorError::StreamNotInitialized(Uuid::nil())),
            }
        };

        match result {
            Ok(()) => {
                // Checked above: Ok implies the handle was present.
                if let Some(handle) = handle {
                    self.served.insert(handle);
                }
                self.output.write_u8(ACK_OK);
                let namespace = self.state.namespace();
                self.metrics.record_received(&namespace, content_length);
                self.flush_output(false).await?;
                Ok(Flow::Continue)
            }
            Err(CollectorError::StreamNotInitialized(handle)) => {
                info!(
                    conn = %self.state.display_name(),
                    %handle,
                    "stream is not registered, requesting stream rotation"
                );
                self.output.write_u8(ACK_ERROR_MAGIC);
                let _ = self.output.flush().await;
                Ok(Flow::Close("unregistered stream"))
            }
            Err(e) => {
                error!(
                    conn = %self.state.display_name(),
                    content_length,
                    error = %e,
                    "exception when receiving data, triggering stream rotation"
                );
                self.output.write_u8(ACK_ERROR_MAGIC);
                let _ = self.output.flush().await;
                Ok(Flow::Close("receiving error"))
            }
        }
    }

    async fn cmd_get_protocol_version_v2(&mut self) -> CollectorResult<Flow> {
        let client_version = self.input.read_i64().await?;
        let pod_name = self.input.read_string().await?;
        let microservice = self.input.read_string().await?;
        let namespace = self.input.read_string().await?;

        let (pod_id, status) = {
            let mut pod = self.state.pod.lock().unwrap();
            pod.set_client_protocol_version(client_version);
            pod.set_pod_name(&pod_name);
            pod.set_microservice(&microservice);
            pod.set_namespace(&namespace);
            pod.touch(now_ms());
            (pod.pod_id().to_string(), pod.clone())
        };

        // The pod may have reconnected without a clean close; release any
        // streams left open by the previous connection.
        let cleaned = self.hub.cleanup_for_pod(&pod_id);
        for handle in &cleaned {
            self.served.remove(handle);
        }

        self.pods.init_pod(status)?;

        self.output.write_i64(PROTOCOL_VERSION_V2);
        self.flush_output(true).await?;
        Ok(Flow::Continue)
    }

    /// Flushes buffered responses, either unconditionally or once the
    /// batching window elapsed.
    async fn flush_output(&mut self, force: bool) -> CollectorResult<()> {
        if force || self.state.need_flush() {
            self.output.flush().await?;
            self.state.mark_flushed();
        }
        Ok(())
    }

    /// Gives each served stream's sink its periodic flush chance.
    fn flush_streams(&mut self) {
        self.hub.flush_due(&mut self.served);
        self.state.mark_flushed();
    }

    /// Marks command processing finished (loop exit).
    pub fn done(&self) {
        self.state.processed(false);
    }

    /// Releases every stream handle this connection served.
    pub fn close_streams(&mut self) {
        for handle in std::mem::take(&mut self.served) {
            self.hub.close_and_forget(handle);
        }
    }

    /// Flushes pending output best-effort and shuts the write side down.
    pub async fn shutdown_output(&mut self) {
        self.output.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};

    use podprof_model::CollectorConfig;
    use podprof_persist::InMemoryPersistence;

    struct Fixture {
        store: Arc<InMemoryPersistence>,
        reader: AgentReader<DuplexStream, DuplexStream>,
        agent_out: FieldWriter<DuplexStream>,
        agent_in: FieldReader<DuplexStream>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryPersistence::new());
        let config = Arc::new(CollectorConfig::default());
        let pods = Arc::new(PodTracker::new(&config, store.clone()));
        let hub = Arc::new(StreamHub::new(config, store.clone(), pods.clone()));
        let metrics = Arc::new(CollectorMetrics::new());
        let state = Arc::new(ConnState::new("test:0".to_string()));

        let (agent_tx, collector_rx) = duplex(64 * 1024);
        let (collector_tx, agent_rx) = duplex(64 * 1024);

        let reader = AgentReader::new(
            hub,
            pods,
            metrics,
            FieldReader::with_timeout(collector_rx, Duration::from_millis(500)),
            FieldWriter::new(collector_tx),
            state,
        );
        Fixture {
            store,
            reader,
            agent_out: FieldWriter::new(agent_tx),
            agent_in: FieldReader::with_timeout(agent_rx, Duration::from_millis(500)),
        }
    }

    const POD: &str = "esc-test-service-58dfcb97-n4f7w_1675853926859";

    async fn handshake_v2(f: &mut Fixture) {
        f.agent_out.write_u8(COMMAND_GET_PROTOCOL_VERSION_V2);
        f.agent_out.write_i64(2);
        f.agent_out.write_string(POD);
        f.agent_out.write_string("esc-test-service");
        f.agent_out.write_string("prod");
        f.agent_out.flush().await.unwrap();

        assert_eq!(f.reader.first_action().await.unwrap(), Flow::Continue);
        assert_eq!(f.agent_in.read_i64().await.unwrap(), PROTOCOL_VERSION_V2);
    }

    #[tokio::test]
    async fn v2_handshake_installs_pod_identity() {
        let mut f = fixture();
        handshake_v2(&mut f).await;

        let pod = f.reader.state().pod.lock().unwrap().clone();
        assert_eq!(pod.pod_id(), "esc-test-service-58dfcb97-n4f7w");
        assert_eq!(pod.namespace(), "prod");
        assert_eq!(f.store.known_pod_count(), 1);
    }

    #[tokio::test]
    async fn legacy_handshake_consumes_companion_command() {
        let mut f = fixture();

        // Legacy agents send GET_PROTOCOL_VERSION (no identity), then the
        // legacy INIT_STREAM carrying the identity strings.
        f.agent_out.write_u8(COMMAND_GET_PROTOCOL_VERSION);
        f.agent_out.write_u8(COMMAND_INIT_STREAM);
        f.agent_out.write_string("prod");
        f.agent_out.write_string("esc-test-service");
        f.agent_out.write_string(POD);
        f.agent_out.write_string("calls");
        f.agent_out.write_i32(-1);
        f.agent_out.write_i32(0);
        f.agent_out.flush().await.unwrap();

        assert_eq!(f.reader.first_action().await.unwrap(), Flow::Continue);

        // Version reply from the legacy command.
        assert_eq!(f.agent_in.read_i64().await.unwrap(), PROTOCOL_VERSION);
        // Stream reply from the fall-through INIT_STREAM body.
        let handle = f.agent_in.read_uuid().await.unwrap();
        assert!(handle.is_some());
        let _rotation_period = f.agent_in.read_i64().await.unwrap();
        let _rotation_size = f.agent_in.read_i64().await.unwrap();
        assert_eq!(f.agent_in.read_i32().await.unwrap(), 0);

        assert!(!f.reader.state().pod_is_empty());
    }

    #[tokio::test]
    async fn invalid_stream_type_replies_nil_and_connection_survives() {
        let mut f = fixture();
        handshake_v2(&mut f).await;

        f.agent_out.write_u8(COMMAND_INIT_STREAM_V2);
        f.agent_out.write_string("bogus");
        f.agent_out.write_i32(-1);
        f.agent_out.write_i32(0);
        f.agent_out.flush().await.unwrap();

        assert_eq!(f.reader.next_action(true).await.unwrap(), Flow::Continue);
        assert_eq!(f.agent_in.read_uuid().await.unwrap(), None);

        // The connection still serves commands.
        f.agent_out.write_u8(COMMAND_REQUEST_ACK_FLUSH);
        f.agent_out.flush().await.unwrap();
        assert_eq!(f.reader.next_action(true).await.unwrap(), Flow::Continue);
        assert_eq!(f.agent_in.read_u8().await.unwrap(), ACK_OK);
    }

    #[tokio::test]
    async fn rcv_data_on_unknown_handle_closes_with_error_magic() {
        let mut f = fixture();
        handshake_v2(&mut f).await;

        f.agent_out.write_u8(COMMAND_RCV_DATA);
        f.agent_out.write_uuid(Some(Uuid::new_v4()));
        f.agent_out.write_field(b"payload");
        f.agent_out.flush().await.unwrap();

        assert_eq!(
            f.reader.next_action(true).await.unwrap(),
            Flow::Close("unregistered stream")
        );
        assert_eq!(f.agent_in.read_u8().await.unwrap(), ACK_ERROR_MAGIC);
    }

    #[tokio::test]
    async fn unknown_command_is_fatal() {
        let mut f = fixture();
        handshake_v2(&mut f).await;

        f.agent_out.write_u8(0xAB);
        f.agent_out.flush().await.unwrap();

        assert!(matches!(
            f.reader.next_action(true).await,
            Err(CollectorError::Protocol(_))
        ));
    }
}
