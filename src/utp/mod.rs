//! Micro transport protocol (uTP).
//!
//! A reliable, ordered byte stream layered over the peer messenger's unreliable message channel.
//! The [`UtpSocket`] is a sans-IO state machine: packets are fed in with
//! [`UtpSocket::on_packet`], timer expiries with [`UtpSocket::on_timeout`], and outbound packets
//! are collected with [`UtpSocket::poll_transmit`]. The [`UtpManager`] (feature `sync`) drives
//! sockets over a [`PeerMessenger`](crate::traits::PeerMessenger).

use std::time::Duration;

use thiserror::Error;

mod congestion;
mod packet;
mod reader;
mod socket;
mod writer;

#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
mod manager;

pub use congestion::CongestionControl;
pub use packet::{Packet, PacketError, PacketHeader, PacketType, SelectiveAck};
pub use reader::ContentReader;
pub use socket::{ConnectionState, SocketKind, UtpSocket};
pub use writer::ContentWriter;

#[cfg(feature = "sync")]
pub use manager::UtpManager;

use crate::traits::MessengerError;

/// The size of a DATA packet payload in bytes.
pub const DEFAULT_PACKET_SIZE: usize = 512;

/// The maximum number of bytes the congestion window grows by per round trip.
pub const MAX_CWND_INCREASE_BYTES_PER_RTT: u32 = 8 * DEFAULT_PACKET_SIZE as u32;

/// The one-way queuing delay the congestion controller aims for.
pub const CCONTROL_TARGET: Duration = Duration::from_millis(100);

/// uTP parameters.
#[derive(Debug, Clone, Copy)]
pub struct UtpConfig {
    /// The size of a DATA payload.
    pub packet_size: usize,
    /// The number of consecutive timeouts without progress after which a socket resets.
    pub max_retries: u8,
    /// The retransmission timeout used before any round trip is measured.
    pub initial_timeout: Duration,
    /// How long a reader that received the whole stream keeps answering retransmitted FINs.
    pub linger: Duration,
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            max_retries: 5,
            initial_timeout: Duration::from_millis(1000),
            linger: Duration::from_millis(2000),
        }
    }
}

/// The pair of connection identifiers of one side of a connection.
///
/// Every packet carries the sender's `send` identifier, which is the receiver's `recv`
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionIds {
    pub send: u16,
    pub recv: u16,
}

impl ConnectionIds {
    /// The identifiers of the side that sends the SYN for an agreed connection id.
    pub fn initiator(connection_id: u16) -> Self {
        Self {
            send: connection_id,
            recv: connection_id.wrapping_add(1),
        }
    }

    /// The identifiers of the side that receives the SYN for an agreed connection id.
    pub fn acceptor(connection_id: u16) -> Self {
        Self {
            send: connection_id.wrapping_add(1),
            recv: connection_id,
        }
    }
}

/// Errors terminating a uTP transfer.
#[derive(Debug, Clone, Error)]
pub enum UtpError {
    /// The remote sent a malformed packet or a packet unexpected in the current state.
    #[error("uTP protocol violation: {0}")]
    ProtocolViolation(String),
    /// The remote reset the connection.
    #[error("the connection was reset by the peer")]
    Reset,
    /// The retry budget was exhausted without progress.
    #[error("the connection timed out")]
    TimedOut,
    /// The socket was dropped before the transfer completed.
    #[error("the connection was closed before the transfer completed")]
    Closed,
    #[error(transparent)]
    Messenger(#[from] MessengerError),
}

impl From<PacketError> for UtpError {
    fn from(err: PacketError) -> Self {
        UtpError::ProtocolViolation(err.to_string())
    }
}

/// Returns `true` if `seq` comes before or is equal to `ack`, taking wrapping into account.
pub fn is_seq_before_or_equal(seq: u16, ack: u16) -> bool {
    ack.wrapping_sub(seq) < 0x8000
}

/// Returns the current time as wrapping microseconds, as carried in packet headers.
pub(crate) fn timestamp_micros() -> u32 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();

    (nanos / 1_000) as u32
}
