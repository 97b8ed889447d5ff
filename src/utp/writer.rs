use bytes::{BufMut, Bytes, BytesMut};

/// Splits a payload into DATA-sized chunks, handed out in order.
#[derive(Debug, Clone)]
pub struct ContentWriter {
    content: Bytes,
    offset: usize,
    packet_size: usize,
}

impl ContentWriter {
    pub fn new(content: Bytes, packet_size: usize) -> Self {
        debug_assert!(packet_size > 0);

        Self {
            content,
            offset: 0,
            packet_size,
        }
    }

    /// Concatenates items, each prefixed with its LEB128-encoded length.
    pub fn frame_items(items: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::new();

        for item in items {
            let mut len = item.len() as u64;
            loop {
                let byte = (len & 0x7f) as u8;
                len >>= 7;
                if len == 0 {
                    buf.put_u8(byte);
                    break;
                }
                buf.put_u8(byte | 0x80);
            }
            buf.put_slice(item);
        }

        buf.freeze()
    }

    /// Returns the number of bytes not handed out yet.
    pub fn remaining(&self) -> usize {
        self.content.len() - self.offset
    }

    /// Returns `true` once every chunk has been handed out.
    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the length of the next chunk, if any.
    pub fn peek_len(&self) -> Option<usize> {
        match self.remaining() {
            0 => None,
            n => Some(n.min(self.packet_size)),
        }
    }

    /// Hands out the next chunk.
    pub fn next_chunk(&mut self) -> Option<Bytes> {
        let len = self.peek_len()?;
        let chunk = self.content.slice(self.offset..self.offset + len);
        self.offset += len;

        Some(chunk)
    }
}
