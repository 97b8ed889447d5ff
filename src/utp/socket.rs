use std::{
    collections::{HashMap, VecDeque},
    mem,
    time::Instant,
};

use bytes::Bytes;
use tracing::*;

use crate::utp::{
    is_seq_before_or_equal, timestamp_micros, CongestionControl, ConnectionIds, ContentReader,
    ContentWriter, Packet, PacketHeader, PacketType, SelectiveAck, UtpConfig, UtpError,
};

// Advertised receive window, readers buffer at most this many bytes ahead of the stream.
const RECEIVE_WINDOW: u32 = 1 << 20;

// The receive window in DATA packets.
fn window_packets(config: &UtpConfig) -> u16 {
    (RECEIVE_WINDOW as usize / config.packet_size.max(1)).min(0x7fff) as u16
}

/// The lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    SynSent,
    SynRecv,
    Connected,
    GotFin,
    Closed,
    Reset,
}

/// The direction of the transfer from this socket's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct Outstanding {
    sent_at: Instant,
    retransmitted: bool,
    packet: Packet,
}

/// One side of a uTP connection.
#[derive(Debug)]
pub struct UtpSocket {
    ids: ConnectionIds,
    kind: SocketKind,
    state: ConnectionState,
    config: UtpConfig,
    // Next sequence number to assign to a SYN, DATA or FIN.
    seq_nr: u16,
    // Last in-order sequence number received.
    ack_nr: u16,
    fin_nr: Option<u16>,
    // Kept to answer a retransmitted SYN.
    syn_ack: Option<Packet>,
    reader: ContentReader,
    writer: Option<ContentWriter>,
    outstanding: HashMap<u16, Outstanding>,
    congestion: CongestionControl,
    outbox: VecDeque<Packet>,
    // Start of the current retransmission period.
    timer: Option<Instant>,
    retries: u8,
    // One-way delay of the last received packet, echoed to the remote.
    reply_micros: u32,
    content: Option<Bytes>,
}

impl UtpSocket {
    /// Creates a socket that receives a stream.
    pub fn new_reader(ids: ConnectionIds, seq_nr: u16, config: UtpConfig) -> Self {
        Self::new(ids, SocketKind::Read, seq_nr, None, config)
    }

    /// Creates a socket that sends `content`.
    pub fn new_writer(ids: ConnectionIds, seq_nr: u16, content: Bytes, config: UtpConfig) -> Self {
        let writer = ContentWriter::new(content, config.packet_size);
        Self::new(ids, SocketKind::Write, seq_nr, Some(writer), config)
    }

    fn new(
        ids: ConnectionIds,
        kind: SocketKind,
        seq_nr: u16,
        writer: Option<ContentWriter>,
        config: UtpConfig,
    ) -> Self {
        Self {
            ids,
            kind,
            state: ConnectionState::None,
            config,
            seq_nr,
            ack_nr: 0,
            fin_nr: None,
            syn_ack: None,
            reader: ContentReader::new(0, window_packets(&config)),
            writer,
            outstanding: HashMap::new(),
            congestion: CongestionControl::new(&config),
            outbox: VecDeque::new(),
            timer: None,
            retries: 0,
            reply_micros: 0,
            content: None,
        }
    }

    pub fn ids(&self) -> ConnectionIds {
        self.ids
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the next sequence number this socket will assign.
    pub fn seq_nr(&self) -> u16 {
        self.seq_nr
    }

    /// Returns the last in-order sequence number received.
    pub fn ack_nr(&self) -> u16 {
        self.ack_nr
    }

    pub fn congestion(&self) -> &CongestionControl {
        &self.congestion
    }

    /// Returns `true` if the sequence number was sent and is not acknowledged yet.
    pub fn is_outstanding(&self, seq_nr: u16) -> bool {
        self.outstanding.contains_key(&seq_nr)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns `true` once the connection is closed or reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnectionState::Closed | ConnectionState::Reset)
    }

    /// Takes the reassembled stream once the FIN has been received.
    pub fn take_content(&mut self) -> Option<Bytes> {
        self.content.take()
    }

    /// Returns the next packet to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Packet> {
        self.outbox.pop_front()
    }

    /// Returns the instant the retransmission timer fires.
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }

        self.timer.map(|start| start + self.congestion.timeout())
    }

    /// Returns the selective ack describing the packets received past the ack number, `None` if
    /// nothing arrived out of order.
    pub fn selective_ack(&self) -> Option<SelectiveAck> {
        let sack = SelectiveAck::from_received(self.ack_nr, |seq| {
            self.reader.is_buffered(seq) || self.fin_nr == Some(seq)
        });

        (sack != SelectiveAck::default()).then_some(sack)
    }

    /// Opens the connection by sending a SYN.
    pub fn connect(&mut self, now: Instant) -> Result<(), UtpError> {
        if self.state != ConnectionState::None {
            return Err(UtpError::ProtocolViolation(format!(
                "connect in state {:?}",
                self.state
            )));
        }

        let syn = self.packet(PacketType::Syn, self.seq_nr, Bytes::new(), None);
        self.track(syn.clone(), now);
        self.outbox.push_back(syn);
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.state = ConnectionState::SynSent;

        debug!(conn_id = self.ids.recv, kind = ?self.kind, "SYN sent");

        Ok(())
    }

    /// Waits for the remote's SYN, the retransmission timer bounds the wait.
    pub fn accept(&mut self, now: Instant) {
        self.timer = Some(now);
    }

    /// Applies an inbound packet.
    pub fn on_packet(&mut self, packet: Packet, now: Instant) -> Result<(), UtpError> {
        if packet.connection_id() != self.ids.recv {
            trace!(conn_id = packet.connection_id(), "packet for another connection");
            return Ok(());
        }

        if self.is_terminal() {
            // Our final ack may have been lost.
            if self.state == ConnectionState::Closed
                && self.kind == SocketKind::Read
                && matches!(packet.packet_type(), PacketType::Data | PacketType::Fin)
            {
                self.queue_state();
            }
            return Ok(());
        }

        self.reply_micros = timestamp_micros().wrapping_sub(packet.header.timestamp_micros);
        if packet.packet_type() != PacketType::Reset {
            self.congestion.update_delay(self.reply_micros, now);
        }

        match packet.packet_type() {
            PacketType::Reset => {
                debug!(conn_id = self.ids.recv, "RESET received");
                self.state = ConnectionState::Reset;
                self.outbox.clear();
                Err(UtpError::Reset)
            }
            PacketType::Syn => self.on_syn(packet, now),
            PacketType::State => self.on_state(packet, now),
            PacketType::Data => self.on_data(packet, now),
            PacketType::Fin => self.on_fin(packet, now),
        }
    }

    /// Handles the retransmission timer firing.
    pub fn on_timeout(&mut self, now: Instant) -> Result<(), UtpError> {
        match self.deadline() {
            Some(deadline) if deadline <= now => {}
            _ => return Ok(()),
        }

        self.retries += 1;
        if self.retries > self.config.max_retries {
            debug!(conn_id = self.ids.recv, retries = self.config.max_retries, "retries exhausted");
            self.reset();
            return Err(UtpError::TimedOut);
        }

        self.congestion.throttle();
        self.timer = Some(now);

        let oldest = self
            .outstanding
            .iter()
            .min_by_key(|(seq, outstanding)| (outstanding.sent_at, seq.wrapping_sub(self.seq_nr)))
            .map(|(seq, _)| *seq);

        if let Some(oldest) = oldest {
            self.retransmit(oldest, now);
        } else if self.kind == SocketKind::Read
            && matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::SynRecv
            )
        {
            self.queue_state();
        }

        self.flush(now);

        Ok(())
    }

    fn on_syn(&mut self, packet: Packet, now: Instant) -> Result<(), UtpError> {
        match self.state {
            ConnectionState::None => {}
            // The remote didn't get our answer.
            _ if self.syn_ack.is_some() => {
                if let Some(syn_ack) = self.syn_ack.clone() {
                    self.outbox.push_back(syn_ack);
                }
                return Ok(());
            }
            state => return self.violation(format!("SYN in state {:?}", state)),
        }

        self.state = ConnectionState::SynRecv;
        self.ack_nr = packet.seq_nr();
        self.reader.reset_start(packet.seq_nr().wrapping_add(1));

        let syn_ack = self.packet(PacketType::State, self.seq_nr, Bytes::new(), None);
        self.syn_ack = Some(syn_ack.clone());
        self.outbox.push_back(syn_ack);
        self.state = ConnectionState::Connected;
        self.timer = Some(now);

        debug!(conn_id = self.ids.recv, kind = ?self.kind, "SYN received, connected");
        self.flush(now);

        Ok(())
    }

    fn on_state(&mut self, packet: Packet, now: Instant) -> Result<(), UtpError> {
        match self.state {
            ConnectionState::SynSent => {
                self.state = ConnectionState::Connected;
                // The SYN-ACK carries the first DATA sequence number, DATA may have overtaken it.
                let advanced = self.reader.reset_start(packet.seq_nr());
                self.ack_nr = self.reader.next_seq().wrapping_sub(1);
                debug!(
                    conn_id = self.ids.recv,
                    kind = ?self.kind,
                    ack_nr = self.ack_nr,
                    "connected"
                );

                if self.kind == SocketKind::Read {
                    if self.fin_nr == Some(self.reader.next_seq()) {
                        self.outstanding.clear();
                        return self.complete(self.reader.next_seq());
                    }
                    if advanced || self.reader.buffered_len() > 0 {
                        self.queue_state();
                    }
                }
            }
            ConnectionState::None => return self.violation("STATE before SYN".to_string()),
            _ => {}
        }

        self.process_ack(packet.ack_nr(), packet.selective_ack, now);

        if self.kind == SocketKind::Write && self.fin_nr == Some(packet.ack_nr()) {
            debug!(conn_id = self.ids.recv, "FIN acked, closing");
            self.state = ConnectionState::Closed;
            self.timer = None;
            return Ok(());
        }

        self.flush(now);

        Ok(())
    }

    fn on_data(&mut self, packet: Packet, now: Instant) -> Result<(), UtpError> {
        if self.kind == SocketKind::Write {
            return self.violation("DATA sent to a writer".to_string());
        }

        match self.state {
            // Held unacked until the SYN-ACK tells where the stream starts, the SYN is
            // retransmitted meanwhile.
            ConnectionState::SynSent => {
                trace!(conn_id = self.ids.recv, seq = packet.seq_nr(), "DATA before SYN-ACK");
                self.reader.hold(packet.seq_nr(), packet.payload);
                return Ok(());
            }
            ConnectionState::None => return self.violation("DATA before SYN".to_string()),
            _ => {}
        }

        let seq_nr = packet.seq_nr();
        if self.reader.add_packet(seq_nr, packet.payload) {
            self.retries = 0;
        }
        self.ack_nr = self.reader.next_seq().wrapping_sub(1);
        self.timer = Some(now);

        if self.fin_nr == Some(self.reader.next_seq()) {
            return self.complete(self.reader.next_seq());
        }

        self.queue_state();

        Ok(())
    }

    fn on_fin(&mut self, packet: Packet, now: Instant) -> Result<(), UtpError> {
        if self.kind == SocketKind::Write {
            return self.violation("FIN sent to a writer".to_string());
        }
        if self.state == ConnectionState::None {
            return self.violation("FIN before SYN".to_string());
        }

        let fin_nr = packet.seq_nr();
        self.fin_nr = Some(fin_nr);
        self.timer = Some(now);

        if self.state == ConnectionState::SynSent {
            return Ok(());
        }

        if fin_nr == self.reader.next_seq() {
            return self.complete(fin_nr);
        }

        debug!(conn_id = self.ids.recv, fin_nr, ack_nr = self.ack_nr, "FIN ahead of data");
        self.queue_state();

        Ok(())
    }

    // Every packet up to the FIN has been received.
    fn complete(&mut self, fin_nr: u16) -> Result<(), UtpError> {
        self.state = ConnectionState::GotFin;
        self.ack_nr = fin_nr;

        let next = ContentReader::new(fin_nr.wrapping_add(1), window_packets(&self.config));
        let reader = mem::replace(&mut self.reader, next);
        let content = reader.finish();
        debug!(conn_id = self.ids.recv, len = content.len(), "stream complete");
        self.content = Some(content);

        self.queue_state();
        self.state = ConnectionState::Closed;
        self.timer = None;

        Ok(())
    }

    fn process_ack(&mut self, ack_nr: u16, selective_ack: Option<SelectiveAck>, now: Instant) {
        let mut acked: Vec<u16> = self
            .outstanding
            .keys()
            .copied()
            .filter(|seq| is_seq_before_or_equal(*seq, ack_nr))
            .collect();
        if let Some(sack) = selective_ack {
            acked.extend(sack.acked(ack_nr).filter(|seq| self.outstanding.contains_key(seq)));
        }

        if acked.is_empty() {
            return;
        }

        let mut sample = None;
        for seq in acked {
            if let Some(outstanding) = self.outstanding.remove(&seq) {
                self.congestion.on_acked(outstanding.packet.payload.len());
                if !outstanding.retransmitted && (sample.is_none() || seq == ack_nr) {
                    sample = Some(now.saturating_duration_since(outstanding.sent_at));
                }
            }
        }

        if let Some(sample) = sample {
            self.congestion.update_rtt(sample);
        }

        self.retries = 0;
        self.timer = Some(now);
    }

    // Sends as much of the writer's content as the window allows, then the FIN.
    fn flush(&mut self, now: Instant) {
        if self.state != ConnectionState::Connected || self.writer.is_none() {
            return;
        }

        while let Some(len) = self.writer.as_ref().and_then(ContentWriter::peek_len) {
            if !self.congestion.can_send(len) {
                break;
            }
            match self.writer.as_mut().and_then(ContentWriter::next_chunk) {
                Some(chunk) => self.send_data(chunk, now),
                None => break,
            }
        }

        let finished = self.writer.as_ref().map_or(false, ContentWriter::is_finished);
        if finished && self.outstanding.is_empty() && self.fin_nr.is_none() {
            let fin = self.packet(PacketType::Fin, self.seq_nr, Bytes::new(), None);
            self.fin_nr = Some(self.seq_nr);
            self.track(fin.clone(), now);
            self.outbox.push_back(fin);
            self.seq_nr = self.seq_nr.wrapping_add(1);

            debug!(conn_id = self.ids.recv, fin_nr = ?self.fin_nr, "all data acked, FIN sent");
        }
    }

    fn send_data(&mut self, payload: Bytes, now: Instant) {
        let len = payload.len();
        let packet = self.packet(PacketType::Data, self.seq_nr, payload, None);

        self.track(packet.clone(), now);
        self.congestion.on_sent(len);
        self.outbox.push_back(packet);
        self.seq_nr = self.seq_nr.wrapping_add(1);
    }

    fn track(&mut self, packet: Packet, now: Instant) {
        if self.outstanding.is_empty() {
            self.timer = Some(now);
        }

        self.outstanding.insert(
            packet.seq_nr(),
            Outstanding {
                sent_at: now,
                retransmitted: false,
                packet,
            },
        );
    }

    fn retransmit(&mut self, seq: u16, now: Instant) {
        let ack_nr = self.ack_nr;
        if let Some(outstanding) = self.outstanding.get_mut(&seq) {
            outstanding.sent_at = now;
            outstanding.retransmitted = true;
            outstanding.packet.header.timestamp_micros = timestamp_micros();
            outstanding.packet.header.ack_nr = ack_nr;

            trace!(conn_id = self.ids.recv, seq, "retransmitting");
            self.outbox.push_back(outstanding.packet.clone());
        }
    }

    fn queue_state(&mut self) {
        let sack = self.selective_ack();
        let state = self.packet(PacketType::State, self.seq_nr, Bytes::new(), sack);
        self.outbox.push_back(state);
    }

    fn reset(&mut self) {
        let reset = self.packet(PacketType::Reset, self.seq_nr, Bytes::new(), None);
        self.outbox.clear();
        self.outbox.push_back(reset);
        self.state = ConnectionState::Reset;
        self.timer = None;
    }

    fn violation(&mut self, reason: String) -> Result<(), UtpError> {
        warn!(conn_id = self.ids.recv, %reason, "protocol violation, resetting");
        self.reset();

        Err(UtpError::ProtocolViolation(reason))
    }

    fn packet(
        &self,
        packet_type: PacketType,
        seq_nr: u16,
        payload: Bytes,
        selective_ack: Option<SelectiveAck>,
    ) -> Packet {
        let window_size = match self.kind {
            SocketKind::Read => RECEIVE_WINDOW,
            SocketKind::Write => self.congestion.max_window(),
        };

        Packet {
            header: PacketHeader {
                packet_type,
                connection_id: self.ids.send,
                timestamp_micros: timestamp_micros(),
                timestamp_delta_micros: self.reply_micros,
                window_size,
                seq_nr,
                ack_nr: self.ack_nr,
            },
            selective_ack,
            payload,
        }
    }
}
