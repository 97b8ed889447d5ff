//! Wire framing for the two sub-protocols sharing a peer connection.
//!
//! Every frame is length-delimited and starts with the identifier of the sub-protocol carrying
//! it: content messages travel on [`CONTENT_PROTOCOL`] as bincode, uTP packets travel on
//! [`UTP_PROTOCOL`] as their raw header and payload.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::message::Message;

/// The sub-protocol identifier of content messages.
pub const CONTENT_PROTOCOL: &[u8] = &[0x50, 0x0b];

/// The sub-protocol identifier reserved for uTP packets.
pub const UTP_PROTOCOL: &[u8] = b"utp";

/// A unit of traffic between two peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Content(Message),
    Utp(Bytes),
}

impl Frame {
    /// Returns the identifier of the sub-protocol carrying the frame.
    pub fn protocol(&self) -> &'static [u8] {
        match self {
            Frame::Content(_) => CONTENT_PROTOCOL,
            Frame::Utp(_) => UTP_PROTOCOL,
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::Content(message)
    }
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Frames [`Frame`]s with a length prefix followed by the sub-protocol identifier.
pub struct FrameCodec {
    codec: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            codec: LengthDelimitedCodec::new(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        if !bytes.has_remaining() {
            return Err(invalid_data("empty frame"));
        }
        let id_len = usize::from(bytes.get_u8());
        if bytes.remaining() < id_len {
            return Err(invalid_data("truncated sub-protocol identifier"));
        }
        let protocol = bytes.split_to(id_len);

        match &protocol[..] {
            CONTENT_PROTOCOL => {
                match bincode::decode_from_slice(&bytes, bincode::config::standard()) {
                    Ok((message, _length)) => Ok(Some(Frame::Content(message))),
                    Err(e) => Err(invalid_data(e)),
                }
            }
            UTP_PROTOCOL => Ok(Some(Frame::Utp(bytes.freeze()))),
            other => Err(invalid_data(format!("unknown sub-protocol {:02x?}", other))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let protocol = frame.protocol();
        let mut body = BytesMut::new();
        body.put_u8(protocol.len() as u8);
        body.put_slice(protocol);

        match frame {
            Frame::Content(message) => {
                let bytes = bincode::encode_to_vec(message, bincode::config::standard())
                    .map_err(invalid_data)?;
                body.put_slice(&bytes);
            }
            Frame::Utp(packet) => body.put_slice(&packet),
        }

        self.codec.encode(body.freeze(), dst)
    }
}
