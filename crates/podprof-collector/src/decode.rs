//! Phrase decoders for the metadata streams.
//!
//! A decoder receives whole phrases (already reframed by the stream
//! parser) and accumulates typed records until the sink drains them for
//! bulk persistence. Decoders are stateful per stream instance: the params
//! version byte and the suspend-log base timestamp appear once at the head
//! of the first phrase and apply to everything after.
//!
//! Numbers inside phrases use the agent's var-int encoding: 7-bit groups,
//! least significant first, high bit as continuation. Strings are a
//! var-int byte length followed by UTF-8 bytes.

use thiserror::Error;
use tracing::warn;

use podprof_model::{PodIdRestart, StreamType};
use podprof_persist::{DictionaryRecord, MetaBatch, ParamRecord, SuspendRecord};

/// Errors while decoding a single phrase. The phrase's records are lost;
/// the stream and connection continue.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("phrase ended mid-record")]
    UnexpectedEof,

    #[error("var-int does not terminate")]
    BadVarInt,

    #[error("non-utf8 string in phrase")]
    BadString,
}

/// Decodes phrases of one metadata stream into typed records.
pub trait PhraseDecoder: Send {
    fn decode(&mut self, phrase: &[u8]) -> Result<(), DecodeError>;

    /// Removes and returns everything accumulated so far.
    fn drain(&mut self) -> MetaBatch;
}

/// Decoder for a metadata stream type; `None` for non-metadata streams.
pub fn decoder_for(stream: StreamType, pod: &PodIdRestart) -> Option<Box<dyn PhraseDecoder>> {
    match stream {
        StreamType::Dictionary => Some(Box::new(DictionaryDecoder::new(pod.clone(), -1))),
        StreamType::Params => Some(Box::new(ParamsDecoder::new(pod.clone()))),
        StreamType::Suspend => Some(Box::new(SuspendDecoder::new(pod.clone()))),
        _ => None,
    }
}

// ── Cursor ───────────────────────────────────────────────────────────

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.data.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u64_be(&mut self) -> Result<u64, DecodeError> {
        if self.pos + 8 > self.data.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let v = u64::from_be_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn read_var_int(&mut self) -> Result<i64, DecodeError> {
        let mut result: u64 = 0;
        for group in 0u32..10 {
            let b = self.read_u8()?;
            result |= u64::from(b & 0x7F).wrapping_shl(7 * group);
            if b & 0x80 == 0 {
                return Ok(result as i64);
            }
        }
        Err(DecodeError::BadVarInt)
    }

    fn read_var_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_var_int()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::BadVarInt)?;
        if self.pos + len > self.data.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let s = std::str::from_utf8(&self.data[self.pos..self.pos + len])
            .map_err(|_| DecodeError::BadString)?
            .to_string();
        self.pos += len;
        Ok(s)
    }
}

// ── Dictionary ───────────────────────────────────────────────────────

/// Dictionary phrases are a plain sequence of var-strings; each entry gets
/// the next running position.
pub struct DictionaryDecoder {
    pod: PodIdRestart,
    last_known_position: i32,
    records: Vec<DictionaryRecord>,
}

impl DictionaryDecoder {
    pub fn new(pod: PodIdRestart, last_known_position: i32) -> Self {
        Self {
            pod,
            last_known_position,
            records: Vec::new(),
        }
    }
}

impl PhraseDecoder for DictionaryDecoder {
    fn decode(&mut self, phrase: &[u8]) -> Result<(), DecodeError> {
        let mut cursor = Cursor::new(phrase);
        while !cursor.eof() {
            let tag = cursor.read_var_string()?;
            self.last_known_position += 1;
            self.records.push(DictionaryRecord {
                pod: self.pod.clone(),
                position: self.last_known_position,
                tag,
            });
        }
        Ok(())
    }

    fn drain(&mut self) -> MetaBatch {
        MetaBatch::Dictionary(std::mem::take(&mut self.records))
    }
}

// ── Params ───────────────────────────────────────────────────────────

/// Param phrases carry one version byte at the head of the first phrase,
/// then records of (name, indexed, list, order, signature).
pub struct ParamsDecoder {
    pod: PodIdRestart,
    version: Option<u8>,
    records: Vec<ParamRecord>,
}

impl ParamsDecoder {
    pub fn new(pod: PodIdRestart) -> Self {
        Self {
            pod,
            version: None,
            records: Vec::new(),
        }
    }
}

impl PhraseDecoder for ParamsDecoder {
    fn decode(&mut self, phrase: &[u8]) -> Result<(), DecodeError> {
        let mut cursor = Cursor::new(phrase);
        if self.version.is_none() {
            let version = cursor.read_u8()?;
            if version != 1 {
                warn!(version, "unexpected params stream version");
            }
            self.version = Some(version);
        }
        while !cursor.eof() {
            let name = cursor.read_var_string()?;
            let indexed = cursor.read_u8()? == 1;
            let list = cursor.read_u8()? == 1;
            let order = cursor.read_var_int()? as i32;
            let signature = cursor.read_var_string()?;
            self.records.push(ParamRecord {
                pod: self.pod.clone(),
                name,
                indexed,
                list,
                order,
                signature,
            });
        }
        Ok(())
    }

    fn drain(&mut self) -> MetaBatch {
        MetaBatch::Params(std::mem::take(&mut self.records))
    }
}

// ── Suspend log ──────────────────────────────────────────────────────

/// Suspend phrases open with a fixed u64 base timestamp (first phrase
/// only), then (delta, suspended) var-int pairs; the running timestamp
/// carries across phrases.
pub struct SuspendDecoder {
    pod: PodIdRestart,
    start_time_ms: u64,
    current_time_ms: u64,
    records: Vec<SuspendRecord>,
}

impl SuspendDecoder {
    pub fn new(pod: PodIdRestart) -> Self {
        Self {
            pod,
            start_time_ms: 0,
            current_time_ms: 0,
            records: Vec::new(),
        }
    }
}

impl PhraseDecoder for SuspendDecoder {
    fn decode(&mut self, phrase: &[u8]) -> Result<(), DecodeError> {
        let mut cursor = Cursor::new(phrase);
        if self.start_time_ms == 0 {
            self.start_time_ms = cursor.read_u64_be()?;
            self.current_time_ms = self.start_time_ms;
        }
        while !cursor.eof() {
            let delta = cursor.read_var_int()?;
            let suspended = cursor.read_var_int()?;
            self.current_time_ms = self.current_time_ms.wrapping_add_signed(delta);
            self.records.push(SuspendRecord {
                pod: self.pod.clone(),
                time_ms: self.current_time_ms,
                delta_ms: delta,
                suspended_ms: suspended,
            });
        }
        Ok(())
    }

    fn drain(&mut self) -> MetaBatch {
        MetaBatch::Suspend(std::mem::take(&mut self.records))
    }
}
