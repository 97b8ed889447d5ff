//! Peer records.

use std::net::SocketAddr;

#[cfg(feature = "codec")]
use bincode::{Decode, Encode};

use crate::core::id::NodeId;

/// A versioned peer descriptor.
///
/// The node identifier is the record's identity: a record with a higher sequence number replaces
/// the stored value but never changes the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Enr {
    node_id: NodeId,
    seq: u64,
    addr: SocketAddr,
}

impl Enr {
    /// Creates a new record.
    pub fn new(node_id: NodeId, seq: u64, addr: SocketAddr) -> Self {
        Self { node_id, seq, addr }
    }

    /// Returns the peer's identifier.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the record's sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the address the peer can be reached at.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns a copy of the record with a new address and an incremented sequence number.
    pub fn with_addr(&self, addr: SocketAddr) -> Self {
        Self {
            node_id: self.node_id,
            seq: self.seq + 1,
            addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::core::id::Id;

    #[test]
    fn with_addr_keeps_identity() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let enr = Enr::new(Id::from_u16(7), 1, addr);

        let moved = enr.with_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9001));

        assert_eq!(moved.node_id(), enr.node_id());
        assert_eq!(moved.seq(), 2);
        assert_ne!(moved, enr);
    }
}
