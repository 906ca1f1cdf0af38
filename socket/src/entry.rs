//! Per-connection protocol state.
//!
//! An [`Entry`] is pure state: it never touches a link or a thread. Every
//! operation returns a [`Transition`] describing the commands to put on the
//! bound link and the notable events the coordinator has to act on. This
//! keeps the whole protocol testable by feeding commands by hand.
//!
//! # States
//!
//! ```text
//!  connector:  Init ─▶ ConnectorNewConnSent ─────────────┐
//!  connectee:  Init ─▶ ConnecteeNewConnAck1Sent ─────────┤
//!                                                        ▼
//!  ┌──────────────── join ─────────────────────── Established ──▶ ClosingInit
//!  │                                                  │                 │
//!  Dead ◀─────────────── link lost ───────────────────┘     ClosingSentReadyWaitReady
//!  DeadClosing ◀──── link lost while closing ───────────── ClosingReceivedReadySentReady
//!  │                                                                    │
//!  └──────────────── join-close ─────────▶ closing states ──────────▶ Closed
//! ```

use {
    crate::{
        command::{CommandBody, DataPacket, FinalPacket, PacketRef, Signal},
        config::RelinkConfig,
        error::{RelinkError, Result},
        input::InputBuffer,
        triplet::Triplet,
    },
    log::*,
    std::{
        collections::VecDeque,
        sync::Arc,
        time::{Duration, Instant},
    },
    strum_macros::{Display, EnumIter, IntoStaticStr},
};

/// Protocol state of one side of a virtual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum EntryState {
    Init,
    ConnectorNewConnSent,
    ConnecteeNewConnAck1Sent,
    Established,
    /// Link lost; waiting for a replacement link and a join.
    Dead,
    /// Link lost while closing; waiting for a join-close.
    DeadClosing,
    ConnectorJoinSent,
    ConnectorJoinWaitDataRequest,
    ConnectorJoinWaitReady,
    ConnecteeJoinAck1Sent,
    ConnecteeJoinDataRequestSent,
    ConnectorJoinCloseSent,
    ConnecteeJoinCloseAck1Sent,
    ClosingInit,
    ClosingSentReadyWaitReady,
    ClosingReceivedReadySentReady,
    Closed,
}

impl EntryState {
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            Self::ClosingInit | Self::ClosingSentReadyWaitReady | Self::ClosingReceivedReadySentReady
        )
    }

    pub fn is_established_or_closing(self) -> bool {
        self == Self::Established || self.is_closing() || self == Self::Closed
    }

    pub fn is_established_or_establishing(self) -> bool {
        matches!(
            self,
            Self::Established
                | Self::ConnectorNewConnSent
                | Self::ConnecteeNewConnAck1Sent
                | Self::ConnectorJoinSent
                | Self::ConnectorJoinWaitDataRequest
                | Self::ConnectorJoinWaitReady
                | Self::ConnecteeJoinAck1Sent
                | Self::ConnecteeJoinDataRequestSent
        )
    }

    /// States in which the entry waits for a replacement link.
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Dead | Self::DeadClosing)
    }

    /// States in which a link is bound and data packets flow.
    pub fn carries_data(self) -> bool {
        matches!(
            self,
            Self::Established
                | Self::ConnectorJoinWaitReady
                | Self::ConnecteeJoinDataRequestSent
        ) || self.is_closing()
    }
}

/// Everything a single operation on an [`Entry`] asks the coordinator to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Commands for the bound link, in order.
    pub outbound: Vec<CommandBody>,
    /// The entry entered `Established`.
    pub established: bool,
    /// ... and it had never been established before.
    pub first_established: bool,
    /// A join or join-close handshake completed.
    pub recovered: bool,
    /// The entry reached `Closed`.
    pub closed: bool,
    /// Packets put on the wire a second time.
    pub retransmitted: u64,
    /// Inbound data packets dropped as duplicates.
    pub duplicates: u64,
}

impl Transition {
    pub(crate) fn send(&mut self, body: CommandBody) {
        self.outbound.push(body);
    }
}

/// Progress through the close handshake.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CloseProgress {
    /// The close handshake has started (locally or by the peer).
    pub active: bool,
    /// Our close-data-request went out on the current link.
    pub data_requested: bool,
    /// First id the peer will never send, once it told us its final id.
    pub peer_end: Option<u64>,
    pub sent_ready: bool,
    pub received_ready: bool,
    /// The peer acknowledged our ready-to-close.
    pub ready_acked: bool,
}

#[derive(Debug)]
struct AckTracker {
    bytes_since_ack: usize,
    last_ack_at: Instant,
    /// Packets received and not acknowledged yet.
    unacked: bool,
    /// An ack was skipped because the receive buffer was full.
    withheld: bool,
}

impl AckTracker {
    fn new() -> Self {
        Self {
            bytes_since_ack: 0,
            last_ack_at: Instant::now(),
            unacked: false,
            withheld: false,
        }
    }
}

/// Flow-control limits copied from [`RelinkConfig`].
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_send_buffer_bytes: Option<usize>,
    ack_threshold_bytes: usize,
    ack_interval: Duration,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Entry {
    triplet: Triplet,
    state: EntryState,
    next_send_id: u64,
    next_recv_id: u64,
    next_transmit_id: u64,
    /// One past the highest id ever put on the wire.
    transmitted_end: u64,
    acked_through: Option<u64>,
    /// Unacknowledged packets, oldest first, ids contiguous.
    sent_packets: VecDeque<DataPacket>,
    input: Arc<InputBuffer>,
    ever_established: bool,
    /// Local close requested while a handshake was in progress.
    pending_local_close: bool,
    close: CloseProgress,
    acks: AckTracker,
    /// Our data request currently awaiting the packet it names.
    outstanding_request: Option<u64>,
    limits: Limits,
}

impl Entry {
    pub fn new(triplet: Triplet, config: &RelinkConfig) -> Self {
        Self {
            triplet,
            state: EntryState::Init,
            next_send_id: 0,
            next_recv_id: 0,
            next_transmit_id: 0,
            transmitted_end: 0,
            acked_through: None,
            sent_packets: VecDeque::new(),
            input: Arc::new(InputBuffer::new(config.max_receive_buffer_bytes)),
            ever_established: false,
            pending_local_close: false,
            close: CloseProgress::default(),
            acks: AckTracker::new(),
            outstanding_request: None,
            limits: Limits {
                max_send_buffer_bytes: config.max_send_buffer_bytes,
                ack_threshold_bytes: config.ack_threshold_bytes,
                ack_interval: config.ack_interval,
            },
        }
    }

    pub fn triplet(&self) -> &Triplet {
        &self.triplet
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn input(&self) -> &Arc<InputBuffer> {
        &self.input
    }

    pub fn is_input_pipe_closed(&self) -> bool {
        self.input.is_closed()
    }

    pub fn ever_established(&self) -> bool {
        self.ever_established
    }

    pub fn close_progress(&self) -> &CloseProgress {
        &self.close
    }

    pub fn next_send_id(&self) -> u64 {
        self.next_send_id
    }

    pub fn next_recv_id(&self) -> u64 {
        self.next_recv_id
    }

    pub fn acked_through(&self) -> Option<u64> {
        self.acked_through
    }

    /// Ids of the packets kept for retransmission.
    pub fn retained_ids(&self) -> Vec<u64> {
        self.sent_packets.iter().map(|p| p.packet_id).collect()
    }

    /// Bytes on the wire and not acknowledged yet.
    pub fn outstanding_bytes(&self) -> usize {
        self.sent_packets
            .iter()
            .take_while(|p| p.packet_id < self.next_transmit_id)
            .map(|p| p.payload.len())
            .sum()
    }

    pub(crate) fn set_state(&mut self, state: EntryState) {
        trace!("{}: {} -> {}", self.triplet, self.state, state);
        self.state = state;
    }

    fn refused(&self) -> RelinkError {
        RelinkError::Refused { state: self.state }
    }

    // ── Local operations ────────────────────────────────────────────────────

    /// Connector: start the new-connection handshake on a fresh link.
    pub fn initiate_new_connection(&mut self, host: &str, port: u16) -> Result<Transition> {
        if self.state != EntryState::Init || !self.triplet.are_we_connector {
            return Err(self.refused());
        }
        let mut t = Transition::default();
        self.set_state(EntryState::ConnectorNewConnSent);
        t.send(CommandBody::NewConn(crate::command::NewConnTarget {
            host: host.to_string(),
            port,
        }));
        Ok(t)
    }

    /// Connector: resume a dead connection on a replacement link.
    pub fn initiate_join(&mut self) -> Result<Transition> {
        if self.state != EntryState::Dead || !self.triplet.are_we_connector {
            return Err(self.refused());
        }
        let mut t = Transition::default();
        self.set_state(EntryState::ConnectorJoinSent);
        t.send(CommandBody::JoinConn(Signal));
        Ok(t)
    }

    /// Connector: resume a dead, closing connection on a replacement link.
    pub fn initiate_join_close(&mut self) -> Result<Transition> {
        if self.state != EntryState::DeadClosing || !self.triplet.are_we_connector {
            return Err(self.refused());
        }
        let mut t = Transition::default();
        self.set_state(EntryState::ConnectorJoinCloseSent);
        t.send(CommandBody::JoinCloseConn(Signal));
        Ok(t)
    }

    /// The application handed over a packet. `packet.packet_id` must be the
    /// next send id. Accepted while the link is dead; refused once the close
    /// handshake started.
    pub fn on_data_sent(&mut self, packet: DataPacket) -> Result<Transition> {
        if self.state == EntryState::Closed
            || self.close.active
            || self.pending_local_close
            || self.state.is_closing()
        {
            return Err(RelinkError::ConnectionClosed);
        }
        if packet.packet_id != self.next_send_id {
            return Err(self.refused());
        }
        self.next_send_id = self.next_send_id.saturating_add(1);
        self.sent_packets.push_back(packet);
        let mut t = Transition::default();
        if self.state == EntryState::Established {
            self.flush_unsent(&mut t);
        }
        Ok(t)
    }

    /// The application closed its side.
    pub fn on_local_close(&mut self) -> Transition {
        let mut t = Transition::default();
        if self.state == EntryState::Closed || self.close.active || self.pending_local_close {
            return t;
        }
        match self.state {
            EntryState::Established => self.start_close(&mut t),
            EntryState::Dead => {
                self.close.active = true;
                self.set_state(EntryState::DeadClosing);
            }
            _ if !self.ever_established => {
                // Nothing was ever exchanged; there is nothing to protect.
                self.input.close();
                self.set_state(EntryState::Closed);
                t.closed = true;
            }
            _ => self.pending_local_close = true,
        }
        t
    }

    /// The bound link died. Returns the transition; the new state tells the
    /// coordinator whether a recovery is needed.
    pub fn on_link_lost(&mut self) -> Transition {
        let mut t = Transition::default();
        self.outstanding_request = None;
        self.close.data_requested = false;
        // Whatever was in flight may be lost; resend from the ack watermark.
        self.next_transmit_id = self.acked_through.map_or(0, |id| id.saturating_add(1));
        match self.state {
            EntryState::Init | EntryState::Dead | EntryState::DeadClosing | EntryState::Closed => {}
            EntryState::ConnectorNewConnSent => {
                self.input.reset();
                self.acks = AckTracker::new();
                self.next_recv_id = 0;
                self.set_state(EntryState::Init);
            }
            EntryState::ClosingInit
            | EntryState::ClosingSentReadyWaitReady
            | EntryState::ClosingReceivedReadySentReady => {
                if self.close.sent_ready && self.close.received_ready {
                    // Both directions are known complete.
                    self.input.close();
                    self.set_state(EntryState::Closed);
                    t.closed = true;
                } else {
                    self.set_state(EntryState::DeadClosing);
                }
            }
            EntryState::ConnectorJoinCloseSent | EntryState::ConnecteeJoinCloseAck1Sent => {
                self.set_state(EntryState::DeadClosing);
            }
            EntryState::ConnecteeNewConnAck1Sent
            | EntryState::Established
            | EntryState::ConnectorJoinSent
            | EntryState::ConnectorJoinWaitDataRequest
            | EntryState::ConnectorJoinWaitReady
            | EntryState::ConnecteeJoinAck1Sent
            | EntryState::ConnecteeJoinDataRequestSent => {
                if self.pending_local_close && self.ever_established {
                    self.pending_local_close = false;
                    self.close.active = true;
                }
                if self.close.active {
                    self.set_state(EntryState::DeadClosing);
                } else {
                    self.set_state(EntryState::Dead);
                }
            }
        }
        t
    }

    /// The receive buffer drained below its cap, or the application flushed.
    pub fn on_flush(&mut self) -> Transition {
        let mut t = Transition::default();
        if !self.state.carries_data() {
            return t;
        }
        if (self.acks.withheld || self.acks.unacked) && !self.input.is_at_cap() {
            self.send_ack(&mut t);
        }
        self.flush_unsent(&mut t);
        t
    }

    /// Periodic timer: ack bytes that have been waiting too long.
    pub fn on_tick(&mut self, now: Instant) -> Transition {
        let mut t = Transition::default();
        if self.state.carries_data()
            && self.acks.unacked
            && !self.input.is_at_cap()
            && now.saturating_duration_since(self.acks.last_ack_at) >= self.limits.ack_interval
        {
            self.send_ack(&mut t);
        }
        t
    }

    /// The coordinator is going away; wake any reader.
    pub fn abandon(&mut self) {
        if self.state != EntryState::Closed {
            self.input.abort();
            self.set_state(EntryState::Closed);
        }
    }

    // ── Building blocks used by the command handlers ────────────────────────

    pub(crate) fn become_established(&mut self, t: &mut Transition) {
        self.set_state(EntryState::Established);
        t.established = true;
        if !self.ever_established {
            self.ever_established = true;
            t.first_established = true;
        }
        self.flush_unsent(t);
        if self.close.active {
            self.resume_closing(t);
        } else if self.pending_local_close {
            self.pending_local_close = false;
            self.start_close(t);
        }
    }

    pub(crate) fn start_close(&mut self, t: &mut Transition) {
        self.close.active = true;
        self.set_state(EntryState::ClosingInit);
        t.send(CommandBody::CloseConn(Signal));
    }

    /// Pick the close handshake up again on a replacement link.
    pub(crate) fn resume_closing(&mut self, t: &mut Transition) {
        self.close.active = true;
        self.close.data_requested = false;
        self.set_state(EntryState::ClosingInit);
        self.update_closing_state(t);
        if t.closed {
            return;
        }
        t.send(CommandBody::CloseConn(Signal));
        if self.close.sent_ready && !self.close.ready_acked {
            t.send(CommandBody::ReadyToClose(Signal));
        }
        self.check_ready(t);
    }

    /// The peer started closing.
    pub(crate) fn enter_closing_from_peer(&mut self, t: &mut Transition) {
        self.close.active = true;
        self.pending_local_close = false;
        if !self.state.is_closing() {
            self.set_state(EntryState::ClosingInit);
        }
        t.send(CommandBody::AckCloseConn(Signal));
        self.request_close_data(t);
    }

    pub(crate) fn request_close_data(&mut self, t: &mut Transition) {
        if !self.close.data_requested {
            self.close.data_requested = true;
            t.send(CommandBody::CloseDataRequest(PacketRef {
                packet_id: self.next_recv_id,
            }));
        }
    }

    /// Answer a close-data-request: resend what the peer misses, then name
    /// our final packet.
    pub(crate) fn answer_close_data_request(&mut self, first_missing: u64, t: &mut Transition) {
        self.rewind_to(first_missing, t);
        t.send(CommandBody::AckCloseDataRequest(FinalPacket {
            last_packet_id: self.next_send_id.checked_sub(1),
        }));
    }

    pub(crate) fn on_peer_final(&mut self, final_packet: FinalPacket, t: &mut Transition) {
        let end = final_packet
            .last_packet_id
            .map_or(0, |id| id.saturating_add(1));
        self.close.peer_end = Some(end);
        self.check_ready(t);
    }

    pub(crate) fn on_peer_ready(&mut self, t: &mut Transition) {
        t.send(CommandBody::AckReadyToClose(Signal));
        self.close.received_ready = true;
        self.update_closing_state(t);
    }

    pub(crate) fn on_ready_acked(&mut self, t: &mut Transition) {
        if self.close.sent_ready {
            self.close.ready_acked = true;
        }
        self.update_closing_state(t);
    }

    /// Send ready-to-close once every byte the peer will send has arrived.
    pub(crate) fn check_ready(&mut self, t: &mut Transition) {
        if !self.close.active || self.close.sent_ready || !self.state.is_closing() {
            return;
        }
        let Some(end) = self.close.peer_end else {
            return;
        };
        if self.next_recv_id >= end {
            if self.acks.unacked {
                self.send_ack(t);
            }
            self.close.sent_ready = true;
            self.input.close();
            t.send(CommandBody::ReadyToClose(Signal));
            self.update_closing_state(t);
        }
    }

    fn update_closing_state(&mut self, t: &mut Transition) {
        let close = self.close;
        if !close.active || !self.state.is_closing() {
            return;
        }
        let next = if close.sent_ready && close.received_ready && close.ready_acked {
            EntryState::Closed
        } else if close.sent_ready && close.received_ready {
            EntryState::ClosingReceivedReadySentReady
        } else if close.sent_ready {
            EntryState::ClosingSentReadyWaitReady
        } else {
            EntryState::ClosingInit
        };
        if next != self.state {
            self.set_state(next);
        }
        if next == EntryState::Closed {
            self.input.close();
            t.closed = true;
        }
    }

    /// In-order data arrived. Duplicates and gaps are handled here too.
    pub(crate) fn on_data(&mut self, packet: DataPacket, t: &mut Transition) {
        let id = packet.packet_id;
        if id < self.next_recv_id {
            trace!("{}: duplicate packet {}", self.triplet, id);
            t.duplicates = t.duplicates.saturating_add(1);
            return;
        }
        if id > self.next_recv_id {
            if self.outstanding_request != Some(self.next_recv_id) {
                debug!(
                    "{}: gap, got {} expected {}; requesting retransmission",
                    self.triplet, id, self.next_recv_id
                );
                self.outstanding_request = Some(self.next_recv_id);
                t.send(CommandBody::DataRequest(PacketRef {
                    packet_id: self.next_recv_id,
                }));
            }
            return;
        }
        if self.close.peer_end.is_some_and(|end| id >= end) {
            warn!("{}: packet {} past the peer's final packet", self.triplet, id);
            return;
        }

        self.next_recv_id = self.next_recv_id.saturating_add(1);
        if self.outstanding_request.is_some_and(|wanted| wanted <= id) {
            self.outstanding_request = None;
        }
        self.acks.bytes_since_ack = self.acks.bytes_since_ack.saturating_add(packet.payload.len());
        self.acks.unacked = true;
        self.input.push(packet.payload);

        if self.input.is_at_cap() {
            self.acks.withheld = true;
        } else if self.close.active || self.acks.bytes_since_ack >= self.limits.ack_threshold_bytes {
            self.send_ack(t);
        }
        self.check_ready(t);
    }

    /// The peer received everything up to and including `through`.
    pub(crate) fn on_acked(&mut self, through: u64, t: &mut Transition) {
        if through >= self.next_send_id {
            warn!(
                "{}: ack for {} but only {} packets were sent",
                self.triplet, through, self.next_send_id
            );
            return;
        }
        if self.acked_through.is_some_and(|acked| acked >= through) {
            return;
        }
        self.purge_through(through);
        self.acked_through = Some(through);
        self.next_transmit_id = self.next_transmit_id.max(through.saturating_add(1));
        if self.state.carries_data() {
            self.flush_unsent(t);
        }
    }

    /// Resend everything from `first_wanted`.
    pub(crate) fn rewind_to(&mut self, first_wanted: u64, t: &mut Transition) {
        if first_wanted > self.next_send_id {
            warn!(
                "{}: peer wants {} but only {} packets were sent",
                self.triplet, first_wanted, self.next_send_id
            );
            return;
        }
        if let Some(through) = first_wanted.checked_sub(1) {
            if !self.acked_through.is_some_and(|acked| acked >= through) {
                self.purge_through(through);
                self.acked_through = Some(through);
            }
        }
        self.next_transmit_id = first_wanted.max(self.first_retained_id());
        self.flush_unsent(t);
    }

    /// Put buffered packets on the wire, honouring the send cap.
    pub(crate) fn flush_unsent(&mut self, t: &mut Transition) {
        let mut outstanding = self.outstanding_bytes();
        let first = self.first_retained_id();
        while self.next_transmit_id < self.next_send_id {
            if let Some(cap) = self.limits.max_send_buffer_bytes {
                if outstanding > cap {
                    trace!(
                        "{}: holding packet {}, {} bytes outstanding",
                        self.triplet,
                        self.next_transmit_id,
                        outstanding
                    );
                    break;
                }
            }
            let index = usize::try_from(self.next_transmit_id.saturating_sub(first))
                .unwrap_or(usize::MAX);
            let Some(packet) = self.sent_packets.get(index) else {
                error!(
                    "{}: packet {} missing from the send buffer",
                    self.triplet, self.next_transmit_id
                );
                break;
            };
            outstanding = outstanding.saturating_add(packet.payload.len());
            t.send(CommandBody::Data(packet.clone()));
            if self.next_transmit_id < self.transmitted_end {
                t.retransmitted = t.retransmitted.saturating_add(1);
            }
            self.next_transmit_id = self.next_transmit_id.saturating_add(1);
            self.transmitted_end = self.transmitted_end.max(self.next_transmit_id);
        }
    }

    fn send_ack(&mut self, t: &mut Transition) {
        let Some(through) = self.next_recv_id.checked_sub(1) else {
            return;
        };
        t.send(CommandBody::DataReceived(PacketRef { packet_id: through }));
        self.acks.bytes_since_ack = 0;
        self.acks.unacked = false;
        self.acks.withheld = false;
        self.acks.last_ack_at = Instant::now();
    }

    fn purge_through(&mut self, through: u64) {
        while self
            .sent_packets
            .front()
            .is_some_and(|p| p.packet_id <= through)
        {
            self.sent_packets.pop_front();
        }
    }

    fn first_retained_id(&self) -> u64 {
        self.sent_packets
            .front()
            .map_or(self.next_send_id, |p| p.packet_id)
    }

    /// Handshake steps answered by the connectee on a replacement link.
    pub(crate) fn accept_join(&mut self, closing: bool) -> Result<()> {
        if !self.state.is_dead() {
            return Err(self.refused());
        }
        if closing {
            self.close.active = true;
            self.pending_local_close = false;
        }
        Ok(())
    }

    pub(crate) fn resync_request(&self) -> CommandBody {
        CommandBody::DataRequestOnReconnect(PacketRef {
            packet_id: self.next_recv_id,
        })
    }

    pub(crate) fn resync_reply(&self) -> CommandBody {
        CommandBody::AckDataRequestOnReconnect(PacketRef {
            packet_id: self.next_recv_id,
        })
    }

    /// Connector whose join was answered with "unknown connection".
    pub(crate) fn lose(&mut self, t: &mut Transition) {
        error!("{}: peer no longer knows this connection", self.triplet);
        self.input.abort();
        self.set_state(EntryState::Closed);
        t.closed = true;
    }

    /// Connector whose join-close was answered with "unknown connection":
    /// the peer finished the close and forgot the connection.
    pub(crate) fn finish_close_remotely(&mut self, t: &mut Transition) {
        self.input.close();
        self.set_state(EntryState::Closed);
        t.closed = true;
    }
}
