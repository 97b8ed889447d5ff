//! uTP wire format.
//!
//! ```text
//! 0       4       8               16              24              32
//! +-------+-------+---------------+---------------+---------------+
//! | type  | ver   | extension     | connection_id                 |
//! +-------+-------+---------------+---------------+---------------+
//! | timestamp_microseconds                                        |
//! +---------------+---------------+---------------+---------------+
//! | timestamp_difference_microseconds                             |
//! +---------------+---------------+---------------+---------------+
//! | wnd_size                                                      |
//! +---------------+---------------+---------------+---------------+
//! | seq_nr                        | ack_nr                        |
//! +---------------+---------------+---------------+---------------+
//! ```
//!
//! All fields are big-endian. Extensions follow the header as `(next extension, length, bytes)`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 20;
const EXTENSION_NONE: u8 = 0;
const EXTENSION_SELECTIVE_ACK: u8 = 1;

/// The packet types, the discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            n => Err(PacketError::UnknownType(n)),
        }
    }
}

/// Errors produced when decoding a malformed packet.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported uTP version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet type: {0}")]
    UnknownType(u8),
    #[error("malformed extension")]
    InvalidExtension,
}

/// The fixed 20-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub timestamp_micros: u32,
    pub timestamp_delta_micros: u32,
    pub window_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

/// A 32-bit selective acknowledgement.
///
/// Bit `i` (least-significant bit of the first byte first) acknowledges sequence number
/// `ack_nr + 2 + i`; `ack_nr + 1` is implicitly missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectiveAck([u8; 4]);

impl SelectiveAck {
    /// The number of sequence numbers covered by the bitmask.
    pub const BITS: u16 = 32;

    pub fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Builds the bitmask for the sequence numbers received past `ack_nr`.
    pub fn from_received(ack_nr: u16, is_received: impl Fn(u16) -> bool) -> Self {
        let mut bytes = [0u8; 4];
        for i in 0..Self::BITS {
            if is_received(ack_nr.wrapping_add(2).wrapping_add(i)) {
                bytes[(i / 8) as usize] |= 1 << (i % 8);
            }
        }

        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Returns `true` if bit `i` is set.
    pub fn is_set(&self, i: u16) -> bool {
        i < Self::BITS && self.0[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    /// Returns the sequence numbers acknowledged relative to `ack_nr`.
    pub fn acked(&self, ack_nr: u16) -> impl Iterator<Item = u16> + '_ {
        (0..Self::BITS)
            .filter(|i| self.is_set(*i))
            .map(move |i| ack_nr.wrapping_add(2).wrapping_add(i))
    }
}

/// A uTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub selective_ack: Option<SelectiveAck>,
    pub payload: Bytes,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn seq_nr(&self) -> u16 {
        self.header.seq_nr
    }

    pub fn ack_nr(&self) -> u16 {
        self.header.ack_nr
    }

    pub fn connection_id(&self) -> u16 {
        self.header.connection_id
    }

    /// Serialises the packet.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 6 + self.payload.len());
        let extension = if self.selective_ack.is_some() {
            EXTENSION_SELECTIVE_ACK
        } else {
            EXTENSION_NONE
        };

        buf.put_u8(((self.header.packet_type as u8) << 4) | VERSION);
        buf.put_u8(extension);
        buf.put_u16(self.header.connection_id);
        buf.put_u32(self.header.timestamp_micros);
        buf.put_u32(self.header.timestamp_delta_micros);
        buf.put_u32(self.header.window_size);
        buf.put_u16(self.header.seq_nr);
        buf.put_u16(self.header.ack_nr);

        if let Some(sack) = &self.selective_ack {
            buf.put_u8(EXTENSION_NONE);
            buf.put_u8(4);
            buf.put_slice(&sack.bytes());
        }

        buf.put_slice(&self.payload);

        buf.freeze()
    }

    /// Parses a packet, rejecting malformed headers and extensions.
    pub fn decode(mut bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::TooShort(bytes.len()));
        }

        let type_version = bytes.get_u8();
        let version = type_version & 0x0f;
        if version != VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let packet_type = PacketType::try_from(type_version >> 4)?;
        let mut extension = bytes.get_u8();

        let header = PacketHeader {
            packet_type,
            connection_id: bytes.get_u16(),
            timestamp_micros: bytes.get_u32(),
            timestamp_delta_micros: bytes.get_u32(),
            window_size: bytes.get_u32(),
            seq_nr: bytes.get_u16(),
            ack_nr: bytes.get_u16(),
        };

        let mut selective_ack = None;
        while extension != EXTENSION_NONE {
            if bytes.remaining() < 2 {
                return Err(PacketError::InvalidExtension);
            }
            let next = bytes.get_u8();
            let len = bytes.get_u8() as usize;
            if bytes.remaining() < len {
                return Err(PacketError::InvalidExtension);
            }
            let data = bytes.split_to(len);

            if extension == EXTENSION_SELECTIVE_ACK {
                // Longer bitmasks are legal on the wire, only the first 32 bits are used.
                if len < 4 || len % 4 != 0 {
                    return Err(PacketError::InvalidExtension);
                }
                selective_ack = Some(SelectiveAck([data[0], data[1], data[2], data[3]]));
            }

            extension = next;
        }

        Ok(Self {
            header,
            selective_ack,
            payload: bytes,
        })
    }
}
