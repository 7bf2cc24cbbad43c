//! Chunk-buffering sink and the sink variant dispatch.

use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use podprof_model::time::now_ms;
use podprof_model::{PodIdRestart, StreamType};
use podprof_persist::{SharedPersistence, StreamChunk};
use podprof_wire::consts::MAX_FLUSH_INTERVAL;

use crate::decode::decoder_for;
use crate::error::CollectorResult;
use crate::pods::PodTracker;
use crate::streams::parsed::ParsedSink;

/// One open stream's sink: where its bytes go.
pub enum StreamSink {
    /// Metadata streams: decode phrases into typed records.
    Parsed(ParsedSink),
    /// Binary streams: buffer and persist chunked payloads.
    Chunked(ChunkSink),
}

impl StreamSink {
    /// Builds the sink variant for a stream type.
    pub fn for_stream(
        handle: Uuid,
        pod: PodIdRestart,
        stream: StreamType,
        rolling_sequence_id: i32,
        chunk_size: usize,
        persistence: SharedPersistence,
        pods: Arc<PodTracker>,
    ) -> StreamSink {
        match decoder_for(stream, &pod) {
            Some(decoder) => {
                StreamSink::Parsed(ParsedSink::new(pod, stream, decoder, persistence))
            }
            None => {
                // Heap dumps arrive pre-compressed by the agent and are
                // stored verbatim; other binary streams are compressed at
                // rest.
                let compressed = stream != StreamType::Heap;
                StreamSink::Chunked(ChunkSink::new(
                    handle,
                    pod,
                    stream,
                    rolling_sequence_id,
                    chunk_size,
                    compressed,
                    persistence,
                    pods,
                ))
            }
        }
    }

    pub fn receive(&mut self, data: &[u8]) -> CollectorResult<()> {
        match self {
            StreamSink::Parsed(sink) => sink.receive(data),
            StreamSink::Chunked(sink) => sink.receive(data),
        }
    }

    /// Flushes buffered output if the sink's own policy says it is due.
    /// Returns true when a flush happened.
    pub fn flush_if_due(&mut self) -> CollectorResult<bool> {
        match self {
            StreamSink::Parsed(sink) => sink.flush_if_due(),
            StreamSink::Chunked(sink) => sink.flush_if_due(),
        }
    }

    pub fn close(&mut self) -> CollectorResult<()> {
        match self {
            StreamSink::Parsed(sink) => sink.close(),
            StreamSink::Chunked(sink) => sink.close(),
        }
    }

    /// Bytes this sink has pushed through to persistence.
    pub fn persisted_bytes(&self) -> u64 {
        match self {
            StreamSink::Parsed(sink) => sink.persisted_bytes(),
            StreamSink::Chunked(sink) => sink.persisted_bytes(),
        }
    }
}

/// Buffers stream bytes and persists them as [`StreamChunk`]s with a
/// running start offset. Flushes when the buffer reaches the chunk size
/// or when output has sat unflushed past [`MAX_FLUSH_INTERVAL`].
pub struct ChunkSink {
    handle: Uuid,
    pod: PodIdRestart,
    stream: StreamType,
    rolling_sequence_id: i32,
    compressed: bool,
    chunk_size: usize,
    buf: Vec<u8>,
    /// Byte offset of the next chunk within this rotation instance.
    offset: u64,
    /// 0 = never flushed, so the first receive flushes immediately.
    last_flushed_ms: u64,
    persistence: SharedPersistence,
    pods: Arc<PodTracker>,
}

impl ChunkSink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Uuid,
        pod: PodIdRestart,
        stream: StreamType,
        rolling_sequence_id: i32,
        chunk_size: usize,
        compressed: bool,
        persistence: SharedPersistence,
        pods: Arc<PodTracker>,
    ) -> Self {
        Self {
            handle,
            pod,
            stream,
            rolling_sequence_id,
            compressed,
            chunk_size,
            buf: Vec::with_capacity(chunk_size),
            offset: 0,
            last_flushed_ms: 0,
            persistence,
            pods,
        }
    }

    pub fn receive(&mut self, data: &[u8]) -> CollectorResult<()> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.chunk_size {
            let rest = self.buf.split_off(self.chunk_size);
            let full = std::mem::replace(&mut self.buf, rest);
            self.emit(full)?;
        }
        if self.flush_due() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush_due(&self) -> bool {
        now_ms().saturating_sub(self.last_flushed_ms) > MAX_FLUSH_INTERVAL.as_millis() as u64
    }

    pub fn flush_if_due(&mut self) -> CollectorResult<bool> {
        if !self.flush_due() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn flush(&mut self) -> CollectorResult<()> {
        if !self.buf.is_empty() {
            let data = std::mem::take(&mut self.buf);
            self.emit(data)?;
        } else {
            self.last_flushed_ms = now_ms();
        }
        Ok(())
    }

    fn emit(&mut self, data: Vec<u8>) -> CollectorResult<()> {
        let len = data.len();
        trace!(
            handle = %self.handle,
            stream = %self.stream,
            bytes = len,
            offset = self.offset,
            "persisting stream chunk"
        );
        self.persistence.insert_stream_chunk(StreamChunk {
            pod: self.pod.clone(),
            stream: self.stream,
            rolling_sequence_id: self.rolling_sequence_id,
            start_pos: self.offset,
            compressed: self.compressed,
            data,
        })?;
        self.pods.persisted(&self.pod, self.stream, len);
        self.offset += len as u64;
        self.last_flushed_ms = now_ms();
        Ok(())
    }

    pub fn close(&mut self) -> CollectorResult<()> {
        self.flush()
    }

    pub fn persisted_bytes(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use podprof_model::CollectorConfig;
    use podprof_persist::InMemoryPersistence;

    fn pod() -> PodIdRestart {
        PodIdRestart::parse_original("esc-test-service-58dfcb97-n4f7w_1675853926859").unwrap()
    }

    fn sink(store: Arc<InMemoryPersistence>, chunk_size: usize) -> ChunkSink {
        let pods = Arc::new(PodTracker::new(&CollectorConfig::default(), store.clone()));
        ChunkSink::new(
            Uuid::new_v4(),
            pod(),
            StreamType::Calls,
            0,
            chunk_size,
            true,
            store,
            pods,
        )
    }

    #[test]
    fn chunks_carry_running_offsets_and_full_payload() {
        let store = Arc::new(InMemoryPersistence::new());
        let mut sink = sink(store.clone(), 8);

        sink.receive(&[1; 10]).unwrap();
        sink.receive(&[2; 10]).unwrap();
        sink.close().unwrap();

        let chunks = store.chunks();
        assert!(chunks.len() >= 2);
        // Offsets are contiguous.
        let mut expected = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.start_pos, expected);
            expected += chunk.data.len() as u64;
        }
        assert_eq!(expected, 20);
        assert_eq!(sink.persisted_bytes(), 20);

        let mut payload = vec![1u8; 10];
        payload.extend_from_slice(&[2; 10]);
        assert_eq!(store.chunk_payload(&pod(), StreamType::Calls), payload);
    }

    #[test]
    fn heap_sink_marks_chunks_uncompressed() {
        let store = Arc::new(InMemoryPersistence::new());
        let pods = Arc::new(PodTracker::new(
            &CollectorConfig::default(),
            store.clone(),
        ));
        let mut sink = match StreamSink::for_stream(
            Uuid::new_v4(),
            pod(),
            StreamType::Heap,
            0,
            1024,
            store.clone(),
            pods,
        ) {
            StreamSink::Chunked(s) => s,
            StreamSink::Parsed(_) => panic!("heap must use a chunk sink"),
        };

        sink.receive(b"hprof").unwrap();
        sink.close().unwrap();
        assert!(store.chunks().iter().all(|c| !c.compressed));
    }

    #[test]
    fn close_flushes_the_tail() {
        let store = Arc::new(InMemoryPersistence::new());
        let mut sink = sink(store.clone(), 1024);

        sink.receive(b"tail").unwrap();
        // First receive flushes immediately (never-flushed sink), so the
        // bytes are already out; a second short write then buffers.
        sink.receive(b"more").unwrap();
        sink.close().unwrap();
        assert_eq!(
            store.chunk_payload(&pod(), StreamType::Calls),
            b"tailmore".to_vec()
        );
    }
}
