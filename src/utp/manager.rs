use std::{collections::HashMap, sync::Arc, time::Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::*;

use crate::{
    core::{enr::Enr, id::NodeId},
    traits::PeerMessenger,
    utp::{ConnectionIds, ConnectionState, Packet, SocketKind, UtpConfig, UtpError, UtpSocket},
};

type SocketKey = (NodeId, u16);
type SocketMap = Arc<RwLock<HashMap<SocketKey, mpsc::UnboundedSender<Packet>>>>;

/// Drives uTP sockets over a [`PeerMessenger`].
///
/// Inbound packets are routed to sockets by `(peer, receive connection id)`. Each socket runs in
/// its own task which owns it exclusively, so every transition is applied without interleaving.
pub struct UtpManager<M> {
    messenger: Arc<M>,
    config: UtpConfig,
    sockets: SocketMap,
}

impl<M> Clone for UtpManager<M> {
    fn clone(&self) -> Self {
        Self {
            messenger: Arc::clone(&self.messenger),
            config: self.config,
            sockets: Arc::clone(&self.sockets),
        }
    }
}

// Removes the socket's route once its task ends, including when it is cancelled.
struct Registration {
    sockets: SocketMap,
    key: SocketKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.sockets.write().remove(&self.key);
    }
}

impl<M: PeerMessenger> UtpManager<M> {
    pub fn new(messenger: Arc<M>, config: UtpConfig) -> Self {
        Self {
            messenger,
            config,
            sockets: Default::default(),
        }
    }

    /// Returns the number of sockets currently running.
    pub fn active_connections(&self) -> usize {
        self.sockets.read().len()
    }

    /// Routes an inbound uTP packet to its socket.
    ///
    /// Malformed packets are rejected, packets for unknown connections are dropped.
    pub fn on_packet(&self, peer: &Enr, bytes: Bytes) -> Result<(), UtpError> {
        let packet = Packet::decode(bytes)?;
        let key = (peer.node_id(), packet.connection_id());

        match self.sockets.read().get(&key) {
            Some(tx) => {
                if tx.send(packet).is_err() {
                    trace!(peer = %peer.node_id(), conn_id = key.1, "socket already finished");
                }
            }
            None => {
                debug!(
                    peer = %peer.node_id(),
                    conn_id = key.1,
                    kind = ?packet.packet_type(),
                    "packet for an unknown connection"
                );
            }
        }

        Ok(())
    }

    /// Serves `content` to a peer that will connect with the returned connection id.
    pub fn accept_write(
        &self,
        peer: Enr,
        content: Bytes,
    ) -> (u16, JoinHandle<Result<(), UtpError>>) {
        let (connection_id, rx, registration) = self.register_acceptor(&peer);
        let mut socket = UtpSocket::new_writer(
            ConnectionIds::acceptor(connection_id),
            rand::random(),
            content,
            self.config,
        );
        socket.accept(Instant::now());

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager
                .drive(peer, socket, rx, registration)
                .await
                .map(|_| ())
        });

        (connection_id, handle)
    }

    /// Reads a stream a peer will write after being told the returned connection id.
    pub fn accept_read(&self, peer: Enr) -> (u16, JoinHandle<Result<Bytes, UtpError>>) {
        let (connection_id, rx, registration) = self.register_acceptor(&peer);
        let mut socket = UtpSocket::new_reader(
            ConnectionIds::acceptor(connection_id),
            rand::random(),
            self.config,
        );
        socket.accept(Instant::now());

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.drive(peer, socket, rx, registration).await?.ok_or(UtpError::Closed)
        });

        (connection_id, handle)
    }

    /// Connects to a peer that announced `connection_id` and reads the content it serves.
    pub async fn connect_read(&self, peer: Enr, connection_id: u16) -> Result<Bytes, UtpError> {
        let ids = ConnectionIds::initiator(connection_id);
        let (rx, registration) = self.register(&peer, ids.recv)?;
        let mut socket = UtpSocket::new_reader(ids, rand::random(), self.config);
        socket.connect(Instant::now())?;

        self.drive(peer, socket, rx, registration).await?.ok_or(UtpError::Closed)
    }

    /// Connects to a peer that accepted an offer under `connection_id` and writes `content`.
    pub async fn connect_write(
        &self,
        peer: Enr,
        connection_id: u16,
        content: Bytes,
    ) -> Result<(), UtpError> {
        let ids = ConnectionIds::initiator(connection_id);
        let (rx, registration) = self.register(&peer, ids.recv)?;
        let mut socket = UtpSocket::new_writer(ids, rand::random(), content, self.config);
        socket.connect(Instant::now())?;

        self.drive(peer, socket, rx, registration).await.map(|_| ())
    }

    // Picks a connection id free in both directions and registers the acceptor's route.
    fn register_acceptor(
        &self,
        peer: &Enr,
    ) -> (u16, mpsc::UnboundedReceiver<Packet>, Registration) {
        let node_id = peer.node_id();
        let mut sockets = self.sockets.write();

        let connection_id = loop {
            let connection_id: u16 = rand::random();
            if !sockets.contains_key(&(node_id, connection_id))
                && !sockets.contains_key(&(node_id, connection_id.wrapping_add(1)))
            {
                break connection_id;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        sockets.insert((node_id, connection_id), tx);

        let registration = Registration {
            sockets: Arc::clone(&self.sockets),
            key: (node_id, connection_id),
        };

        (connection_id, rx, registration)
    }

    fn register(
        &self,
        peer: &Enr,
        recv: u16,
    ) -> Result<(mpsc::UnboundedReceiver<Packet>, Registration), UtpError> {
        let key = (peer.node_id(), recv);
        let mut sockets = self.sockets.write();

        if sockets.contains_key(&key) {
            return Err(UtpError::ProtocolViolation(format!(
                "connection id {} already in use",
                recv
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        sockets.insert(key, tx);

        Ok((
            rx,
            Registration {
                sockets: Arc::clone(&self.sockets),
                key,
            },
        ))
    }

    // Runs a started socket until it closes, returning the content a reader received.
    async fn drive(
        &self,
        peer: Enr,
        mut socket: UtpSocket,
        mut rx: mpsc::UnboundedReceiver<Packet>,
        registration: Registration,
    ) -> Result<Option<Bytes>, UtpError> {
        loop {
            self.transmit(&peer, &mut socket).await?;

            match socket.state() {
                ConnectionState::Closed => {
                    debug!(peer = %peer.node_id(), conn_id = socket.ids().recv, "transfer complete");
                    let content = socket.take_content();
                    if socket.kind() == SocketKind::Read {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            manager.linger(peer, socket, rx, registration).await
                        });
                    }

                    return Ok(content);
                }
                ConnectionState::Reset => return Err(UtpError::Reset),
                _ => {}
            }

            let deadline = match socket.deadline() {
                Some(deadline) => time::Instant::from_std(deadline),
                None => time::Instant::now() + self.config.initial_timeout,
            };

            let res = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => socket.on_packet(packet, Instant::now()),
                    None => Err(UtpError::Closed),
                },
                _ = time::sleep_until(deadline) => socket.on_timeout(Instant::now()),
            };

            if let Err(e) = res {
                debug!(peer = %peer.node_id(), conn_id = socket.ids().recv, "transfer failed: {}", e);
                // Delivers the RESET, if any.
                let _ = self.transmit(&peer, &mut socket).await;
                return Err(e);
            }
        }
    }

    // Keeps a closed reader routed so a FIN retransmitted after a lost final ack is acked again.
    async fn linger(
        &self,
        peer: Enr,
        mut socket: UtpSocket,
        mut rx: mpsc::UnboundedReceiver<Packet>,
        _registration: Registration,
    ) {
        let until = time::Instant::now() + self.config.linger;

        loop {
            tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        let _ = socket.on_packet(packet, Instant::now());
                    }
                    None => return,
                },
                _ = time::sleep_until(until) => return,
            }

            if let Err(e) = self.transmit(&peer, &mut socket).await {
                trace!(peer = %peer.node_id(), conn_id = socket.ids().recv, "re-ack failed: {}", e);
                return;
            }
        }
    }

    async fn transmit(&self, peer: &Enr, socket: &mut UtpSocket) -> Result<(), UtpError> {
        while let Some(packet) = socket.poll_transmit() {
            self.messenger.send_utp(peer, packet.encode()).await?;
        }

        Ok(())
    }
}
