//! Phrase reframing for stream payloads.
//!
//! Stream bytes arrive in arbitrary `RCV_DATA`-sized slices; metadata
//! decoders need whole *phrases* (4-byte big-endian length + payload).
//! [`PhraseBuffer`] bridges the two: callers append raw slices and pull out
//! complete phrases, while partial trailing data stays buffered until the
//! next append.
//!
//! The buffer is fixed-capacity and reused for the lifetime of a stream.
//! Already-consumed bytes are reclaimed by compaction, triggered lazily
//! only when an incoming copy would overflow — not on every phrase.

use crate::consts::MAX_PHRASE_SIZE;
use crate::error::{WireError, WireResult};

/// Fixed-capacity reframing buffer; at most `max_phrase` unread bytes.
pub struct PhraseBuffer {
    buf: Box<[u8]>,
    /// Next unconsumed byte.
    pos: usize,
    /// One past the last buffered byte.
    len: usize,
    /// Length of the pending phrase; 0 = waiting for a length prefix.
    phrase_len: usize,
    max_phrase: usize,
}

impl PhraseBuffer {
    pub fn new() -> Self {
        Self::with_max_phrase(MAX_PHRASE_SIZE)
    }

    /// Custom phrase bound, for exercising compaction with small buffers.
    pub fn with_max_phrase(max_phrase: usize) -> Self {
        Self {
            buf: vec![0u8; max_phrase + 1].into_boxed_slice(),
            pos: 0,
            len: 0,
            phrase_len: 0,
            max_phrase,
        }
    }

    fn unread(&self) -> usize {
        self.len - self.pos
    }

    /// Copies as much of `data` as fits into the free tail, compacting
    /// away consumed bytes first if the copy would overflow. Returns the
    /// number of bytes consumed; the caller re-invokes for the remainder.
    pub fn append(&mut self, data: &[u8]) -> usize {
        if self.len + data.len() >= self.max_phrase {
            self.compact();
        }
        let n = data.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.pos..self.len, 0);
        self.len -= self.pos;
        self.pos = 0;
    }

    /// Consumes the next 4 unread bytes as the pending phrase length.
    /// Fewer than 4 available is not an error — the pending length stays 0
    /// ("wait for more data").
    pub fn read_phrase_length(&mut self) -> WireResult<()> {
        if self.unread() < 4 {
            self.phrase_len = 0;
            return Ok(());
        }
        let len = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        let len = len as usize;
        if len > self.max_phrase {
            return Err(WireError::Protocol(format!(
                "phrase of {len} bytes exceeds max phrase size of {}",
                self.max_phrase
            )));
        }
        self.phrase_len = len;
        Ok(())
    }

    /// Length recorded by the last [`PhraseBuffer::read_phrase_length`].
    pub fn phrase_len(&self) -> usize {
        self.phrase_len
    }

    /// True iff a pending phrase is fully buffered.
    pub fn can_read_full_phrase(&self) -> bool {
        self.phrase_len != 0 && self.unread() >= self.phrase_len
    }

    /// Consumes the pending phrase and returns its payload. The caller may
    /// tee the returned slice to a secondary sink before decoding it.
    ///
    /// Panics in debug builds if no full phrase is buffered; callers gate
    /// on [`PhraseBuffer::can_read_full_phrase`].
    pub fn take_phrase(&mut self) -> &[u8] {
        debug_assert!(self.can_read_full_phrase());
        let start = self.pos;
        self.pos += self.phrase_len;
        let end = self.pos;
        self.phrase_len = 0;
        &self.buf[start..end]
    }
}

impl Default for PhraseBuffer {
    fn default() -> Self {
        Self::new()
    }
}
