use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use tracing::*;

use crate::utp::{is_seq_before_or_equal, UtpError};

/// Reassembles DATA payloads into a contiguous stream.
///
/// Payloads are appended in sequence number order, anything received ahead of the next expected
/// sequence number is buffered until the gap is filled. At most `window` packets past the next
/// expected sequence number are buffered.
#[derive(Debug, Clone)]
pub struct ContentReader {
    next_seq: u16,
    window: u16,
    buffered: HashMap<u16, Bytes>,
    content: BytesMut,
}

impl ContentReader {
    /// Creates a reader expecting `start_seq` as the first DATA sequence number.
    pub fn new(start_seq: u16, window: u16) -> Self {
        Self {
            next_seq: start_seq,
            window,
            buffered: HashMap::new(),
            content: BytesMut::new(),
        }
    }

    /// Returns the next sequence number needed to extend the stream.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// Buffers a payload received before the start of the stream is known.
    pub(crate) fn hold(&mut self, seq: u16, payload: Bytes) {
        if self.buffered.len() >= usize::from(self.window) && !self.buffered.contains_key(&seq) {
            trace!(seq, "receive window full, dropping packet");
            return;
        }

        self.buffered.entry(seq).or_insert(payload);
    }

    /// Sets the start of the stream, only valid before any data was read. Held payloads from
    /// the start on are consumed, returns `true` if the stream advanced.
    pub(crate) fn reset_start(&mut self, start_seq: u16) -> bool {
        debug_assert!(self.content.is_empty());
        self.next_seq = start_seq;

        let window = self.window;
        self.buffered.retain(|seq, _| seq.wrapping_sub(start_seq) < window);

        self.drain_buffered()
    }

    /// Returns `true` if the packet is held out of order.
    pub fn is_buffered(&self, seq: u16) -> bool {
        self.buffered.contains_key(&seq)
    }

    /// Returns the number of packets held out of order.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Returns the contiguous bytes read so far.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Adds a payload, returns `true` if the stream advanced.
    pub fn add_packet(&mut self, seq: u16, payload: Bytes) -> bool {
        if seq != self.next_seq {
            if is_seq_before_or_equal(seq, self.next_seq.wrapping_sub(1)) {
                trace!(seq, "duplicate packet");
            } else if seq.wrapping_sub(self.next_seq) >= self.window {
                trace!(seq, expected = self.next_seq, "packet beyond the receive window");
            } else {
                trace!(seq, expected = self.next_seq, "out of order packet");
                self.buffered.entry(seq).or_insert(payload);
            }

            return false;
        }

        self.content.extend_from_slice(&payload);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.drain_buffered();

        true
    }

    fn drain_buffered(&mut self) -> bool {
        let mut advanced = false;
        while let Some(payload) = self.buffered.remove(&self.next_seq) {
            self.content.extend_from_slice(&payload);
            self.next_seq = self.next_seq.wrapping_add(1);
            advanced = true;
        }

        advanced
    }

    /// Consumes the reader, returning the reassembled stream.
    pub fn finish(self) -> Bytes {
        self.content.freeze()
    }

    /// Splits a stream made of LEB128 length-prefixed items.
    pub fn split_items(mut stream: Bytes) -> Result<Vec<Bytes>, UtpError> {
        let mut items = Vec::new();

        while stream.has_remaining() {
            let len = read_leb128(&mut stream)?;
            if stream.remaining() < len {
                return Err(UtpError::ProtocolViolation(format!(
                    "item of {} bytes exceeds the {} remaining",
                    len,
                    stream.remaining()
                )));
            }
            items.push(stream.split_to(len));
        }

        Ok(items)
    }
}

fn read_leb128(buf: &mut Bytes) -> Result<usize, UtpError> {
    let mut value: u64 = 0;

    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            break;
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value as usize);
        }
    }

    Err(UtpError::ProtocolViolation(
        "truncated length prefix".to_string(),
    ))
}
