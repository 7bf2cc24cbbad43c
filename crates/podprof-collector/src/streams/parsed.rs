//! Metadata stream sink: phrase reframing + decoding + bulk persistence.

use tracing::{error, trace};

use podprof_model::{PodIdRestart, StreamType};
use podprof_persist::SharedPersistence;
use podprof_wire::PhraseBuffer;

use crate::decode::PhraseDecoder;
use crate::error::CollectorResult;
use crate::streams::sink::ChunkSink;

/// Sink for the metadata streams (params, dictionary, suspend log).
///
/// Bytes are reframed into phrases; each complete phrase is optionally
/// teed to a raw-copy chunk sink, then decoded. Decode failures are
/// isolated to the offending phrase. Accumulated records are drained and
/// bulk-persisted at the end of every receive and on due flushes, so the
/// accumulator never grows past one receive's worth of records.
pub struct ParsedSink {
    pod: PodIdRestart,
    stream: StreamType,
    phrases: PhraseBuffer,
    decoder: Box<dyn PhraseDecoder>,
    /// Optional secondary copy of the raw phrase bytes.
    raw_copy: Option<ChunkSink>,
    persistence: SharedPersistence,
    received_total: u64,
}

impl ParsedSink {
    pub fn new(
        pod: PodIdRestart,
        stream: StreamType,
        decoder: Box<dyn PhraseDecoder>,
        persistence: SharedPersistence,
    ) -> Self {
        Self {
            pod,
            stream,
            phrases: PhraseBuffer::new(),
            decoder,
            raw_copy: None,
            persistence,
            received_total: 0,
        }
    }

    /// Attaches a secondary sink that receives every raw phrase.
    pub fn with_raw_copy(mut self, raw_copy: ChunkSink) -> Self {
        self.raw_copy = Some(raw_copy);
        self
    }

    pub fn receive(&mut self, data: &[u8]) -> CollectorResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        trace!(pod = %self.pod, stream = %self.stream, bytes = data.len(), "parsing stream data");
        self.received_total += data.len() as u64;

        let mut added = 0;
        while added < data.len() {
            added += self.phrases.append(&data[added..]);

            if self.phrases.phrase_len() == 0 {
                self.phrases.read_phrase_length()?;
            }
            while self.phrases.can_read_full_phrase() {
                let phrase = self.phrases.take_phrase();
                if let Some(copy) = &mut self.raw_copy {
                    copy.receive(phrase)?;
                }
                if let Err(e) = self.decoder.decode(phrase) {
                    // A corrupt phrase loses only its own records.
                    error!(
                        pod = %self.pod,
                        stream = %self.stream,
                        error = %e,
                        "failed to decode phrase"
                    );
                }
                self.phrases.read_phrase_length()?;
            }
        }

        self.save_data()
    }

    /// Drains the decoder's accumulated records (destructively, exactly
    /// once) and bulk-persists them. No-op when nothing accumulated.
    pub fn save_data(&mut self) -> CollectorResult<()> {
        let batch = self.decoder.drain();
        if batch.is_empty() {
            return Ok(());
        }
        trace!(
            pod = %self.pod,
            stream = %self.stream,
            records = batch.len(),
            "saving decoded records"
        );
        self.persistence.save_meta_batch(&batch)?;
        Ok(())
    }

    pub fn flush_if_due(&mut self) -> CollectorResult<bool> {
        self.save_data()?;
        if let Some(copy) = &mut self.raw_copy {
            return copy.flush_if_due();
        }
        Ok(true)
    }

    pub fn close(&mut self) -> CollectorResult<()> {
        self.save_data()?;
        if let Some(copy) = &mut self.raw_copy {
            copy.close()?;
        }
        Ok(())
    }

    /// Metadata records persist on receipt, so the persisted size equals
    /// everything received.
    pub fn persisted_bytes(&self) -> u64 {
        self.received_total
    }
}
