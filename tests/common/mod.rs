#![cfg(all(feature = "codec", feature = "sync"))]

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use portal_dht::{
    codec::{Frame, FrameCodec},
    content::{ContentHandler, ContentLookup, LookupConfig},
    kbucket::{NodeStatus, SyncRoutingTable, TableConfig},
    message::Message,
    traits::{MemoryStore, MessengerError, PeerMessenger},
    utp::{UtpConfig, UtpManager},
    Enr, NodeId,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::*;
use tracing_subscriber::{fmt, EnvFilter};

#[allow(dead_code)]
pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// An in-process network delivering messages between [`TestNode`]s.
#[derive(Default)]
pub struct Network {
    nodes: RwLock<HashMap<NodeId, TestNode>>,
    next_port: AtomicUsize,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicUsize::new(9000),
            ..Default::default()
        })
    }

    pub fn add_node(self: &Arc<Self>, node_id: NodeId) -> TestNode {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed) as u16;
        let enr = Enr::new(
            node_id,
            1,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        );

        let messenger = Arc::new(LoopbackMessenger {
            local: enr,
            network: Arc::clone(self),
            drop_utp_packet: AtomicUsize::new(0),
            utp_packets: AtomicUsize::new(0),
        });
        let routing_table = SyncRoutingTable::new(node_id, TableConfig::default());
        let store = Arc::new(MemoryStore::new());
        let utp = UtpManager::new(Arc::clone(&messenger), UtpConfig::default());

        let node = TestNode {
            enr,
            messenger: Arc::clone(&messenger),
            routing_table: routing_table.clone(),
            store: Arc::clone(&store),
            utp: utp.clone(),
            handler: ContentHandler::new(routing_table.clone(), Arc::clone(&store), utp.clone()),
            lookup: ContentLookup::new(
                messenger,
                routing_table,
                store,
                utp,
                LookupConfig::default(),
            ),
        };

        self.nodes.write().insert(node_id, node.clone());

        node
    }

    fn node(&self, node_id: &NodeId) -> Option<TestNode> {
        self.nodes.read().get(node_id).cloned()
    }
}

#[derive(Clone)]
pub struct TestNode {
    pub enr: Enr,
    pub messenger: Arc<LoopbackMessenger>,
    pub routing_table: SyncRoutingTable,
    pub store: Arc<MemoryStore>,
    pub utp: UtpManager<LoopbackMessenger>,
    pub handler: ContentHandler<LoopbackMessenger, MemoryStore>,
    pub lookup: ContentLookup<LoopbackMessenger, MemoryStore>,
}

impl TestNode {
    /// Makes `peer` known to this node.
    #[allow(dead_code)]
    pub fn knows(&self, peer: &TestNode) {
        self.routing_table
            .insert_or_update(peer.enr, NodeStatus::Connected);
    }
}

/// Delivers requests to the target node's handler and uTP packets to its manager.
///
/// Everything goes through the [`FrameCodec`] so it is exactly what a wire would carry, and is
/// dispatched on its sub-protocol.
pub struct LoopbackMessenger {
    local: Enr,
    network: Arc<Network>,
    // 1-indexed packet to drop, 0 to deliver everything.
    drop_utp_packet: AtomicUsize,
    utp_packets: AtomicUsize,
}

impl LoopbackMessenger {
    /// Drops the `n`th uTP packet sent from now on.
    #[allow(dead_code)]
    pub fn drop_utp_packet(&self, n: usize) {
        self.utp_packets.store(0, Ordering::SeqCst);
        self.drop_utp_packet.store(n, Ordering::SeqCst);
    }

    fn wire(frame: Frame) -> Result<Frame, MessengerError> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(frame, &mut buf)
            .map_err(|e| MessengerError::Io(e.to_string()))?;
        codec
            .decode(&mut buf)
            .map_err(|e| MessengerError::Io(e.to_string()))?
            .ok_or_else(|| MessengerError::Io("incomplete frame".to_string()))
    }

    // Hands a frame to the target node's sub-protocol, returning the content response if any.
    fn deliver(&self, node: &TestNode, frame: Frame) -> Result<Option<Frame>, MessengerError> {
        match Self::wire(frame)? {
            Frame::Content(request) => {
                trace!(from = %self.local.node_id(), to = %node.enr.node_id(), kind = request.variant_as_str(), "request");
                Ok(node
                    .handler
                    .handle_request(&self.local, request)
                    .map(Frame::Content))
            }
            Frame::Utp(packet) => {
                node.utp
                    .on_packet(&self.local, packet)
                    .map_err(|e| MessengerError::Io(e.to_string()))?;
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl PeerMessenger for LoopbackMessenger {
    async fn send_request(&self, peer: &Enr, request: Message) -> Result<Message, MessengerError> {
        let node = self
            .network
            .node(&peer.node_id())
            .ok_or(MessengerError::Unreachable)?;

        let response = self
            .deliver(&node, Frame::Content(request))?
            .ok_or(MessengerError::Timeout)?;

        match Self::wire(response)? {
            Frame::Content(response) => Ok(response),
            Frame::Utp(_) => Err(MessengerError::Io("uTP packet as a response".to_string())),
        }
    }

    async fn send_utp(&self, peer: &Enr, packet: Bytes) -> Result<(), MessengerError> {
        let node = self
            .network
            .node(&peer.node_id())
            .ok_or(MessengerError::Unreachable)?;

        let n = self.utp_packets.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.drop_utp_packet.load(Ordering::SeqCst) {
            debug!(n, "dropping uTP packet");
            return Ok(());
        }

        self.deliver(&node, Frame::Utp(packet)).map(|_| ())
    }
}
