//! Per-flow protocol state
//!
//! A `Connection` owns everything one flow needs: the lifecycle state
//! machine, the orthogonal migration sub-state, send/receive sequence
//! windows, the nonces authenticating control packets, the retransmission
//! queue with its RTO estimator, and the pending-connection queues when
//! listening. It performs no I/O: inbound packets arrive as
//! [`ConnectionEvent`]s, outbound packets are collected with
//! [`Connection::poll_transmit`], and timer deadlines with
//! [`Connection::poll_timeout`].

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::packet::{ControlFlags, CtrlExtKind, HeaderBuilder, SalContext};
use crate::service::{ResolveMode, ServiceTable, Target};
use crate::shared::{Config, ConnectionEvent, ConnectionEventInner, EndpointEvent, EndpointEventInner};
use crate::{DeviceId, FlowId, Nonce, Protocol, ServiceId, Transmit};

mod queue;
mod rtt;
mod seq;
mod state;
mod timer;

use queue::{ControlQueue, SentControl};
use rtt::RttEstimator;
use seq::{after, before};
use state::{SalState, State};
use timer::{Timer, TimerTable};

/// Send-direction sequence window
#[derive(Debug, Copy, Clone)]
struct SendSeq {
    /// Initial sequence number
    iss: u32,
    /// Oldest unacknowledged sequence number
    una: u32,
    /// Next sequence number to consume
    nxt: u32,
    /// Send window
    wnd: u32,
}

/// Receive-direction sequence window
#[derive(Debug, Copy, Clone)]
struct RecvSeq {
    /// Peer's initial sequence number
    iss: u32,
    /// Next expected sequence number
    nxt: u32,
}

/// A connection request a listener has answered but not yet promoted
#[derive(Debug)]
struct RequestSock {
    local_flowid: FlowId,
    peer_flowid: FlowId,
    peer_srvid: ServiceId,
    local_nonce: Nonce,
    peer_nonce: Nonce,
    /// Our initial sequence number, sent in the SYN-ACK
    iss: u32,
    /// Sequence number of the peer's SYN
    rcv_seq: u32,
    /// The true peer address: head of the Source extension when the SYN was
    /// forwarded, otherwise the packet source
    remote: Ipv4Addr,
    /// Source address to use in the reply, honoring NAT'd first hops
    reply_addr: Ipv4Addr,
    device: DeviceId,
    /// Source extension from the SYN, to be echoed (extended) in the reply
    source: Vec<Ipv4Addr>,
    /// Our address on the receiving interface
    local_addr: Ipv4Addr,
}

/// Protocol state for one flow
pub struct Connection {
    config: Arc<Config>,
    table: Arc<ServiceTable>,
    rng: StdRng,
    state: State,
    sal_state: SalState,
    local_flowid: FlowId,
    peer_flowid: FlowId,
    local_srvid: Option<ServiceId>,
    peer_srvid: Option<ServiceId>,
    protocol: Protocol,
    local_nonce: Nonce,
    peer_nonce: Nonce,
    snd: SendSeq,
    rcv: RecvSeq,
    /// Established peer address; `None` until the handshake resolves one
    remote: Option<Ipv4Addr>,
    device: Option<DeviceId>,
    /// Address the peer is migrating to, valid during an RSYN handshake
    mig_remote: Option<Ipv4Addr>,
    /// Interface we are migrating to, valid while our RSYN is in flight
    mig_device: Option<DeviceId>,
    rtt: RttEstimator,
    backoff: u32,
    retransmits: u32,
    ctrl_queue: ControlQueue,
    timers: TimerTable<Option<Instant>>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,
    endpoint_events: VecDeque<EndpointEventInner>,
    /// Pending requests awaiting their handshake ACK (listeners only)
    syn_queue: Vec<RequestSock>,
    /// Completed children awaiting `accept` (listeners only)
    accept_queue: VecDeque<Connection>,
    error: Option<ConnectionError>,
    fin_sent: bool,
}

impl Connection {
    fn new(
        config: Arc<Config>,
        table: Arc<ServiceTable>,
        state: State,
        local_flowid: FlowId,
        protocol: Protocol,
        mut rng: StdRng,
    ) -> Self {
        let iss: u32 = rng.gen();
        let local_nonce: Nonce = rng.gen();
        let rtt = RttEstimator::new(config.initial_rto, config.rto_min, config.rto_max);
        let send_window = config.send_window;
        Self {
            config,
            table,
            rng,
            state,
            sal_state: SalState::Initial,
            local_flowid,
            peer_flowid: FlowId(0),
            local_srvid: None,
            peer_srvid: None,
            protocol,
            local_nonce,
            peer_nonce: Nonce::default(),
            snd: SendSeq {
                iss,
                una: iss,
                nxt: iss,
                wnd: send_window,
            },
            rcv: RecvSeq { iss: 0, nxt: 0 },
            remote: None,
            device: None,
            mig_remote: None,
            mig_device: None,
            rtt,
            backoff: 0,
            retransmits: 0,
            ctrl_queue: ControlQueue::default(),
            timers: TimerTable::default(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            endpoint_events: VecDeque::new(),
            syn_queue: Vec::new(),
            accept_queue: VecDeque::new(),
            error: None,
            fin_sent: false,
        }
    }

    /// Initiate a connection to `peer_srvid`
    pub(crate) fn new_client(
        config: Arc<Config>,
        table: Arc<ServiceTable>,
        local_flowid: FlowId,
        local_srvid: Option<ServiceId>,
        peer_srvid: ServiceId,
        protocol: Protocol,
        rng: StdRng,
        now: Instant,
    ) -> Self {
        let mut this = Self::new(config, table, State::Init, local_flowid, protocol, rng);
        this.local_srvid = local_srvid;
        this.peer_srvid = Some(peer_srvid);
        this.state = State::Request;
        trace!(flow = %this.local_flowid, service = %peer_srvid, "sending REQUEST");
        this.send_syn(now);
        this
    }

    /// Create a passive-open flow for `local_srvid`
    pub(crate) fn new_listen(
        config: Arc<Config>,
        table: Arc<ServiceTable>,
        local_flowid: FlowId,
        local_srvid: ServiceId,
        protocol: Protocol,
        rng: StdRng,
    ) -> Self {
        let mut this = Self::new(config, table, State::Listen, local_flowid, protocol, rng);
        this.local_srvid = Some(local_srvid);
        this
    }

    /// Create an unconnected datagram flow bound to `local_srvid`
    pub(crate) fn new_datagram(
        config: Arc<Config>,
        table: Arc<ServiceTable>,
        local_flowid: FlowId,
        local_srvid: ServiceId,
        protocol: Protocol,
        rng: StdRng,
    ) -> Self {
        let mut this = Self::new(config, table, State::Init, local_flowid, protocol, rng);
        this.local_srvid = Some(local_srvid);
        this
    }

    /// Our flow identifier
    pub fn local_flow_id(&self) -> FlowId {
        self.local_flowid
    }

    /// The peer's flow identifier, zero until the handshake has exchanged it
    pub fn peer_flow_id(&self) -> FlowId {
        self.peer_flowid
    }

    /// The service identifier this flow connects to, if any
    pub fn peer_service_id(&self) -> Option<ServiceId> {
        self.peer_srvid
    }

    /// The established peer address, if any
    pub fn remote_address(&self) -> Option<Ipv4Addr> {
        self.remote
    }

    /// Whether the flow is established
    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Whether the flow has reached its terminal state and released all
    /// resources
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Current smoothed round-trip estimate, if a sample has been taken
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.rtt.smoothed()
    }

    /// The error that killed the flow, if it died with one
    pub fn error(&self) -> Option<ConnectionError> {
        self.error.clone()
    }

    /// Application-facing events, in the order they occurred
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Packets to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Events to hand to the owning endpoint's `handle_event`
    pub fn poll_endpoint_events(&mut self) -> Option<EndpointEvent> {
        self.endpoint_events.pop_front().map(EndpointEvent)
    }

    /// The next instant at which `handle_timeout` should be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers
            .iter()
            .filter_map(|(_, &deadline)| deadline)
            .min()
    }

    /// Process an event from the endpoint
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        let ConnectionEventInner::Datagram {
            now,
            remote,
            local,
            device,
            ctx,
        } = event.0;
        self.handle_packet(now, remote, local, device, ctx);
    }

    /// Process timer expirations up to `now`
    ///
    /// Timers are idempotent: a deadline that no longer applies to the
    /// current state is discarded without effect.
    pub fn handle_timeout(&mut self, now: Instant) {
        for timer in Timer::VALUES {
            let expired = self.timers[timer].map_or(false, |deadline| deadline <= now);
            if !expired {
                continue;
            }
            self.timers[timer] = None;
            match timer {
                Timer::Retransmit => self.on_retransmit_timeout(now),
                Timer::TimeWait => {
                    debug!(flow = %self.local_flowid, state = %self.state, "linger expired");
                    self.done();
                }
                Timer::KeepAlive => self.on_keepalive_timeout(now),
            }
        }
    }

    /// Accept the next completed incoming connection (listeners)
    pub fn accept(&mut self) -> Option<Connection> {
        self.accept_queue.pop_front()
    }

    /// Close the flow
    ///
    /// Orderly teardown from the synchronized states; immediate release
    /// everywhere else.
    pub fn close(&mut self, now: Instant) {
        match self.state {
            State::Connected | State::Respond => {
                self.enter_lingering(State::FinWait1, Duration::ZERO, now);
                self.send_fin(now);
            }
            State::CloseWait => {
                self.enter_lingering(State::LastAck, Duration::ZERO, now);
                self.send_fin(now);
            }
            State::FinWait1 | State::FinWait2 | State::Closing | State::TimeWait => {
                warn!(state = %self.state, "close in post-close state");
            }
            _ => {
                trace!(state = %self.state, "close releases flow directly");
                self.done();
            }
        }
    }

    /// Move a live flow to a new interface without tearing it down
    ///
    /// Sends a migration request (RSYN) that the peer must acknowledge;
    /// completion is reported with [`Event::Migrated`].
    pub fn migrate(&mut self, now: Instant, device: DeviceId) -> Result<(), SendError> {
        if !self.state.may_migrate() {
            return Err(SendError::InvalidState);
        }
        self.mig_device = Some(device);
        debug!(flow = %self.local_flowid, %device, "sending migration request");
        let verno = self.snd.nxt;
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
        self.send_rsyn(now, verno);
        Ok(())
    }

    /// Send transport payload on an established flow
    pub fn send(&mut self, payload: Bytes) -> Result<(), SendError> {
        if !self.state.is_connected_family() {
            return Err(SendError::InvalidState);
        }
        let builder = self.builder(ControlFlags::default(), false, self.snd.nxt);
        let contents = builder.encode(&payload);
        self.push_direct(contents);
        Ok(())
    }

    /// Send an unconnected datagram to `dest`
    ///
    /// Only valid on a datagram flow; the destination is resolved through
    /// the service table for every call.
    pub fn send_datagram(&mut self, dest: ServiceId, payload: Bytes) -> Result<(), SendError> {
        if self.state != State::Init {
            return Err(SendError::InvalidState);
        }
        let local = self.local_srvid.ok_or(SendError::InvalidState)?;
        // Unconnected datagrams are not sequenced.
        let mut builder = self.builder(ControlFlags::default(), false, 0);
        builder.datagram_srvids = Some((local, dest));
        let contents = builder.encode(&payload);
        self.transmit_resolved(&dest, contents, payload.len())
    }

    // Inbound path

    fn handle_packet(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        local: Ipv4Addr,
        device: DeviceId,
        ctx: SalContext,
    ) {
        // Packets for a pending child still route through the listener.
        if self.state == State::Listen && ctx.dst_flowid != self.local_flowid {
            if let Some(idx) = self
                .accept_queue
                .iter()
                .position(|c| c.local_flowid == ctx.dst_flowid)
            {
                let mut child = self.accept_queue.remove(idx).unwrap();
                child.handle_packet(now, remote, local, device, ctx);
                self.transmits.extend(std::mem::take(&mut child.transmits));
                self.accept_queue.insert(idx, child);
                return;
            }
        }

        trace!(
            flow = %self.local_flowid,
            state = %self.state,
            flags = %ctx.flags,
            verno = ctx.verno,
            "processing packet"
        );

        if ctx.has_verno() && !self.verno_acceptable(&ctx) {
            debug!(
                verno = ctx.verno,
                expected = self.rcv.nxt,
                "version number out of sequence"
            );
            self.send_reset(remote, device, &ctx);
            return;
        }

        if ctx.flags.contains(ControlFlags::RST) {
            self.on_reset();
            return;
        }

        if ctx.flags.contains(ControlFlags::RSYN) {
            if ctx.flags.contains(ControlFlags::ACK) {
                self.on_rsyn_ack(remote, &ctx);
            } else {
                self.on_rsyn(remote, &ctx);
            }
        }

        match self.state {
            State::Init => self.on_packet_init(&ctx),
            State::Request => self.on_packet_request(now, remote, device, &ctx),
            State::Respond => self.on_packet_respond(now, remote, device, &ctx),
            State::Connected => self.on_packet_connected(now, &ctx),
            State::Listen => self.on_packet_listen(now, remote, local, device, &ctx),
            State::FinWait1 => self.on_packet_finwait1(now, &ctx),
            State::FinWait2 => self.on_packet_finwait2(now, &ctx),
            State::Closing => self.on_packet_closing(now, &ctx),
            State::LastAck => self.on_packet_lastack(now, &ctx),
            State::CloseWait => self.on_packet_closewait(now, &ctx),
            State::TimeWait => {
                // Our ACK of the peer's FIN may have been lost.
                if ctx.flags.contains(ControlFlags::FIN) {
                    self.send_ack();
                }
            }
            State::Closed => self.send_reset(remote, device, &ctx),
        }
    }

    fn verno_acceptable(&self, ctx: &SalContext) -> bool {
        if self.state.accepts_any_verno() {
            return true;
        }
        if !before(ctx.verno, self.rcv.nxt) {
            return true;
        }
        // A retransmitted FIN whose ACK was lost must still reach TIME-WAIT
        // processing.
        self.state == State::TimeWait
            && ctx.flags.contains(ControlFlags::FIN)
            && ctx.verno.wrapping_add(1) == self.rcv.nxt
    }

    fn on_packet_init(&mut self, ctx: &SalContext) {
        if self.local_srvid.is_none() || ctx.srv_src.is_none() || ctx.srv_dst.is_none() {
            trace!("non-matching datagram");
            return;
        }
        if ctx.has_payload() {
            self.events.push_back(Event::Payload {
                data: ctx.payload.clone(),
                source: ctx.srv_src,
            });
        }
    }

    fn on_packet_request(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        device: DeviceId,
        ctx: &SalContext,
    ) {
        if ctx.ext_kind != CtrlExtKind::Connection {
            return;
        }
        if !(ctx.flags.contains(ControlFlags::SYN) && ctx.flags.contains(ControlFlags::ACK)) {
            debug!("packet is not a SYN+ACK response");
            return;
        }
        if self.ack_process(now, ctx).is_err() {
            debug!("handshake ACK invalid");
            return;
        }

        self.device = Some(device);
        // A Source extension means the response was forwarded; its last hop
        // is our true destination.
        self.remote = Some(match ctx.source.last() {
            Some(&addr) => addr,
            None => remote,
        });
        self.peer_nonce = ctx.nonce.unwrap_or_default();
        self.peer_flowid = ctx.src_flowid;
        self.rcv.iss = ctx.verno;
        self.rcv.nxt = ctx.verno.wrapping_add(1);

        self.state = State::Connected;
        debug!(flow = %self.local_flowid, peer = %self.peer_flowid, "connected");
        self.events.push_back(Event::Connected);
        self.arm_keepalive(now);

        // The handshake ACK repeats the connection extension; it does not
        // consume a sequence number.
        let builder = self.builder(ControlFlags::ACK, true, self.snd.nxt);
        let contents = builder.encode(&[]);
        self.push_direct(contents);
    }

    fn on_packet_respond(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        device: DeviceId,
        ctx: &SalContext,
    ) {
        if ctx.ext_kind != CtrlExtKind::Connection
            || ctx.nonce.map_or(true, |n| n != self.peer_nonce)
        {
            debug!("connection extension missing or bad nonce");
            return;
        }
        if self.ack_process(now, ctx).is_ok() {
            self.device = Some(device);
            self.remote = Some(remote);
            self.state = State::Connected;
            debug!(flow = %self.local_flowid, "connected");
            self.events.push_back(Event::Connected);
            self.arm_keepalive(now);
        }
    }

    fn on_packet_connected(&mut self, now: Instant, ctx: &SalContext) {
        let _ = self.ack_process(now, ctx);
        if ctx.has_payload() {
            self.events.push_back(Event::Payload {
                data: ctx.payload.clone(),
                source: self.peer_srvid,
            });
        }
        if ctx.flags.contains(ControlFlags::FIN) && self.rcv_fin(ctx).is_ok() {
            self.state = State::CloseWait;
        }
    }

    fn on_packet_listen(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        local: Ipv4Addr,
        device: DeviceId,
        ctx: &SalContext,
    ) {
        let syn = ctx.flags.contains(ControlFlags::SYN);
        let ack = ctx.flags.contains(ControlFlags::ACK);
        if syn && !ack {
            // Duplicate SYNs re-answer from the existing request rather than
            // allocating new state.
            if let Some(idx) = self
                .syn_queue
                .iter()
                .position(|rsk| rsk.peer_flowid == ctx.src_flowid)
            {
                debug!("SYN already received, answering again");
                let contents = self.synack_bytes(idx);
                let rsk = &self.syn_queue[idx];
                let (dst, dev, src) = (rsk.remote, rsk.device, Some(rsk.reply_addr));
                self.transmits.push_back(Transmit {
                    destination: dst,
                    device: Some(dev),
                    source: src,
                    contents: contents.into(),
                });
                return;
            }
            self.on_syn(remote, local, device, ctx);
        } else if ack {
            self.on_handshake_ack(now, remote, local, device, ctx);
        } else {
            self.send_reset(remote, device, ctx);
        }
    }

    fn on_syn(&mut self, remote: Ipv4Addr, local: Ipv4Addr, device: DeviceId, ctx: &SalContext) {
        let Some(peer_srvid) = ctx.conn_srvid else {
            debug!("SYN without connection extension");
            return;
        };
        if self.syn_queue.len() >= self.config.accept_backlog {
            debug!("accept backlog full, dropping request");
            return;
        }
        debug!(verno = ctx.verno, "REQUEST received");

        // With a Source extension the packet was forwarded inside the SAL:
        // the true source is the extension head, and a NAT'd client needs
        // the reply to come from the first hop it addressed.
        let (true_remote, reply_addr) = match ctx.source.first() {
            Some(&origin) => (origin, *ctx.source.get(1).unwrap_or(&local)),
            None => (remote, local),
        };

        let rsk = RequestSock {
            local_flowid: FlowId(self.rng.gen()),
            peer_flowid: ctx.src_flowid,
            peer_srvid,
            local_nonce: self.rng.gen(),
            peer_nonce: ctx.nonce.unwrap_or_default(),
            iss: self.rng.gen(),
            rcv_seq: ctx.verno,
            remote: true_remote,
            reply_addr,
            device,
            source: ctx.source.clone(),
            local_addr: local,
        };
        self.syn_queue.push(rsk);
        let idx = self.syn_queue.len() - 1;
        let contents = self.synack_bytes(idx);
        let rsk = &self.syn_queue[idx];
        let (dst, dev, src) = (rsk.remote, rsk.device, Some(rsk.reply_addr));
        self.transmits.push_back(Transmit {
            destination: dst,
            device: Some(dev),
            source: src,
            contents: contents.into(),
        });
    }

    /// Build the SYN-ACK for the request at `idx` in the SYN queue
    fn synack_bytes(&self, idx: usize) -> Vec<u8> {
        let rsk = &self.syn_queue[idx];
        let mut source = rsk.source.clone();
        if !source.is_empty() {
            // We were not the first hop; append our address and reply toward
            // the original source.
            source.push(rsk.local_addr);
        }
        HeaderBuilder {
            src_flowid: rsk.local_flowid,
            dst_flowid: rsk.peer_flowid,
            protocol: self.protocol,
            flags: ControlFlags::SYN | ControlFlags::ACK,
            conn_ack: false,
            verno: rsk.iss,
            ackno: rsk.rcv_seq.wrapping_add(1),
            nonce: rsk.local_nonce,
            conn_srvid: Some(rsk.peer_srvid),
            datagram_srvids: None,
            source,
        }
        .encode(&[])
    }

    fn on_handshake_ack(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        local: Ipv4Addr,
        device: DeviceId,
        ctx: &SalContext,
    ) {
        let Some(idx) = self
            .syn_queue
            .iter()
            .position(|rsk| rsk.local_flowid == ctx.dst_flowid)
        else {
            trace!("ACK matches no pending request");
            return;
        };
        {
            let rsk = &self.syn_queue[idx];
            if ctx.nonce.map_or(true, |n| n != rsk.peer_nonce) {
                debug!("handshake ACK has bad nonce");
                return;
            }
            if ctx.verno != rsk.rcv_seq.wrapping_add(1) {
                debug!(
                    received = ctx.verno,
                    expected = rsk.rcv_seq.wrapping_add(1),
                    "handshake ACK has bad version number"
                );
                return;
            }
            if ctx.ackno != rsk.iss.wrapping_add(1) {
                debug!(
                    received = ctx.ackno,
                    expected = rsk.iss.wrapping_add(1),
                    "handshake ACK has bad ack number"
                );
                return;
            }
        }
        let rsk = self.syn_queue.remove(idx);

        let mut child = Connection::new(
            self.config.clone(),
            self.table.clone(),
            State::Respond,
            rsk.local_flowid,
            self.protocol,
            StdRng::seed_from_u64(self.rng.gen()),
        );
        child.local_srvid = self.local_srvid;
        child.peer_srvid = Some(rsk.peer_srvid);
        child.peer_flowid = rsk.peer_flowid;
        child.local_nonce = rsk.local_nonce;
        child.peer_nonce = rsk.peer_nonce;
        child.snd = SendSeq {
            iss: rsk.iss,
            una: rsk.iss,
            nxt: rsk.iss.wrapping_add(1),
            wnd: self.config.send_window,
        };
        child.rcv = RecvSeq {
            iss: rsk.rcv_seq,
            nxt: rsk.rcv_seq.wrapping_add(1),
        };
        child.remote = Some(rsk.remote);
        child.device = Some(rsk.device);

        // The child finishes the handshake on the very packet that spawned
        // it.
        child.handle_packet(now, remote, local, device, ctx.clone());
        let transmits = std::mem::take(&mut child.transmits);
        self.transmits.extend(transmits);

        self.endpoint_events
            .push_back(EndpointEventInner::FlowOpened(child.local_flowid));
        self.accept_queue.push_back(child);
        self.events.push_back(Event::Incoming);
    }

    fn on_packet_finwait1(&mut self, now: Instant, ctx: &SalContext) {
        let ack_ok =
            ctx.flags.contains(ControlFlags::ACK) && self.ack_process(now, ctx).is_ok();
        if ctx.flags.contains(ControlFlags::FIN) {
            if self.rcv_fin(ctx).is_ok() {
                if ack_ok {
                    self.enter_lingering(State::TimeWait, self.config.time_wait, now);
                } else {
                    self.enter_lingering(State::Closing, Duration::ZERO, now);
                }
            }
        } else if ack_ok {
            self.enter_lingering(State::FinWait2, Duration::ZERO, now);
        }
        if ctx.has_payload() {
            self.events.push_back(Event::Payload {
                data: ctx.payload.clone(),
                source: self.peer_srvid,
            });
        }
    }

    fn on_packet_finwait2(&mut self, now: Instant, ctx: &SalContext) {
        if ctx.flags.contains(ControlFlags::FIN) && self.rcv_fin(ctx).is_ok() {
            self.enter_lingering(State::TimeWait, self.config.time_wait, now);
        }
        if ctx.has_payload() {
            self.events.push_back(Event::Payload {
                data: ctx.payload.clone(),
                source: self.peer_srvid,
            });
        }
    }

    fn on_packet_closing(&mut self, now: Instant, ctx: &SalContext) {
        if ctx.flags.contains(ControlFlags::ACK) && self.ack_process(now, ctx).is_ok() {
            self.enter_lingering(State::TimeWait, self.config.time_wait, now);
        }
        if ctx.has_payload() {
            self.events.push_back(Event::Payload {
                data: ctx.payload.clone(),
                source: self.peer_srvid,
            });
        }
    }

    fn on_packet_lastack(&mut self, now: Instant, ctx: &SalContext) {
        let ack_ok = self.ack_process(now, ctx).is_ok();
        if ctx.has_payload() {
            self.events.push_back(Event::Payload {
                data: ctx.payload.clone(),
                source: self.peer_srvid,
            });
        }
        if ack_ok {
            debug!("final ACK received, closing");
            self.done();
        }
    }

    fn on_packet_closewait(&mut self, now: Instant, ctx: &SalContext) {
        let _ = self.ack_process(now, ctx);
        if ctx.has_payload() {
            self.events.push_back(Event::Payload {
                data: ctx.payload.clone(),
                source: self.peer_srvid,
            });
        }
    }

    /// Validate and apply an acknowledgement
    fn ack_process(&mut self, now: Instant, ctx: &SalContext) -> Result<(), AckError> {
        if !ctx.flags.contains(ControlFlags::ACK) || ctx.nonce.is_none() {
            return Err(AckError);
        }
        // In the synchronized states control packets must authenticate with
        // the peer's nonce; during the handshake it is not yet known.
        if !self.state.accepts_any_verno() && ctx.nonce != Some(self.peer_nonce) {
            debug!("control extension has bad nonce");
            return Err(AckError);
        }
        if before(ctx.ackno, self.snd.una) {
            debug!(ackno = ctx.ackno, una = self.snd.una, "old ack");
            return Err(AckError);
        }
        if after(ctx.ackno, self.snd.nxt) {
            debug!(ackno = ctx.ackno, nxt = self.snd.nxt, "ack ahead of send state");
            return Err(AckError);
        }

        let cleaned = self.ctrl_queue.clean(ctx.ackno, now);
        if let Some(sample) = cleaned.rtt_sample {
            self.rtt.update(sample, self.snd.una, self.snd.nxt);
            self.backoff = 0;
            trace!(?sample, rto = ?self.rtt.rto(), "rtt updated");
        }
        if cleaned.removed > 0 {
            self.retransmits = 0;
        }
        self.snd.una = ctx.ackno;
        self.rearm_retransmit(now);
        trace!(ackno = ctx.ackno, "valid ACK");

        // Migration handshake completion: a bare ACK (no RSYN bit) closes
        // out the exchange and swaps in the new peer address.
        if !ctx.flags.contains(ControlFlags::RSYN) {
            match self.sal_state {
                SalState::RsynRecv => {
                    self.sal_state = SalState::Initial;
                    self.complete_peer_migration();
                }
                SalState::RsynSentRecv => {
                    self.sal_state = SalState::RsynSent;
                    self.complete_peer_migration();
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn complete_peer_migration(&mut self) {
        if let Some(addr) = self.mig_remote.take() {
            self.remote = Some(addr);
            debug!(flow = %self.local_flowid, remote = %addr, "migration complete");
            self.events.push_back(Event::Migrated {
                remote: addr,
                device: self.device,
            });
        }
    }

    /// Process an orderly close from the peer
    fn rcv_fin(&mut self, ctx: &SalContext) -> Result<(), AckError> {
        if ctx.nonce != Some(self.peer_nonce) {
            debug!("FIN has bad nonce");
            return Err(AckError);
        }
        debug!(flow = %self.local_flowid, "received FIN");
        self.rcv.nxt = ctx.verno.wrapping_add(1);
        self.events.push_back(Event::PeerClosed);
        self.send_ack();
        Ok(())
    }

    fn on_reset(&mut self) {
        let error = match self.state {
            State::Request => ConnectionError::ConnectionRefused,
            State::CloseWait => ConnectionError::BrokenPipe,
            State::Closed => return,
            _ => ConnectionError::ConnectionReset,
        };
        debug!(flow = %self.local_flowid, state = %self.state, %error, "reset by peer");
        self.error = Some(error.clone());
        self.events.push_back(Event::ConnectionLost { reason: error });
        self.done();
    }

    fn on_rsyn(&mut self, remote: Ipv4Addr, ctx: &SalContext) {
        if ctx.nonce != Some(self.peer_nonce) {
            debug!("migration request has bad nonce");
            return;
        }
        if matches!(self.state, State::Closed | State::Listen | State::Request) {
            return;
        }
        debug!(flow = %self.local_flowid, sal_state = %self.sal_state, "received migration request");
        match self.sal_state {
            SalState::Initial => self.sal_state = SalState::RsynRecv,
            SalState::RsynSent => self.sal_state = SalState::RsynSentRecv,
            // Another address change while one is pending: acknowledge the
            // new address below without a further state change.
            SalState::RsynRecv | SalState::RsynSentRecv => {}
        }
        self.rcv.nxt = ctx.verno.wrapping_add(1);
        self.mig_remote = Some(remote);

        // The RSYN-ACK consumes a sequence number; retransmission is the
        // migrating peer's responsibility.
        let verno = self.snd.nxt;
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
        let builder = self.builder(ControlFlags::RSYN | ControlFlags::ACK, false, verno);
        let contents = builder.encode(&[]);
        self.push_direct(contents);
    }

    fn on_rsyn_ack(&mut self, remote: Ipv4Addr, ctx: &SalContext) {
        if ctx.nonce != Some(self.peer_nonce) {
            debug!("migration acknowledgement has bad nonce");
            return;
        }
        debug!(sal_state = %self.sal_state, "received RSYN+ACK");
        match self.sal_state {
            SalState::RsynSent => {
                self.sal_state = SalState::Initial;
                if let Some(device) = self.mig_device.take() {
                    self.device = Some(device);
                }
                self.rcv.nxt = ctx.verno.wrapping_add(1);
                debug!(flow = %self.local_flowid, "migration complete");
                self.events.push_back(Event::Migrated {
                    remote: self.remote.unwrap_or(remote),
                    device: self.device,
                });
                self.send_ack();
            }
            SalState::RsynSentRecv => {
                self.sal_state = SalState::RsynRecv;
                self.mig_remote = Some(remote);
                self.rcv.nxt = ctx.verno.wrapping_add(1);
                self.send_ack();
            }
            _ => {}
        }
    }

    // Outbound path

    /// Base header description for the current flow state
    fn builder(&self, flags: ControlFlags, conn_ack: bool, verno: u32) -> HeaderBuilder {
        HeaderBuilder {
            src_flowid: self.local_flowid,
            dst_flowid: self.peer_flowid,
            protocol: self.protocol,
            flags,
            conn_ack,
            verno,
            ackno: self.rcv.nxt,
            nonce: self.local_nonce,
            conn_srvid: self.peer_srvid,
            datagram_srvids: None,
            source: Vec::new(),
        }
    }

    fn send_syn(&mut self, now: Instant) {
        let verno = self.snd.iss;
        self.snd.nxt = verno.wrapping_add(1);
        self.queue_and_push(
            now,
            SentControl {
                verno,
                flags: ControlFlags::SYN,
                conn_ack: false,
                payload: Bytes::new(),
                when: now,
                retransmitted: false,
            },
        );
    }

    fn send_fin(&mut self, now: Instant) {
        if std::mem::replace(&mut self.fin_sent, true) {
            return;
        }
        let mut flags = ControlFlags::FIN;
        // A FIN racing a migration carries the RSYN bit so a lost RSYN is
        // not silently overridden.
        match self.sal_state {
            SalState::RsynSent => flags |= ControlFlags::RSYN,
            SalState::RsynRecv => flags |= ControlFlags::RSYN | ControlFlags::ACK,
            _ => {}
        }
        let verno = self.snd.nxt;
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
        debug!(flow = %self.local_flowid, verno, "sending FIN");
        self.queue_and_push(
            now,
            SentControl {
                verno,
                flags,
                conn_ack: false,
                payload: Bytes::new(),
                when: now,
                retransmitted: false,
            },
        );
    }

    fn send_rsyn(&mut self, now: Instant, verno: u32) {
        match self.sal_state {
            SalState::Initial => self.sal_state = SalState::RsynSent,
            SalState::RsynRecv => self.sal_state = SalState::RsynSentRecv,
            SalState::RsynSent | SalState::RsynSentRecv => {}
        }
        let mut flags = ControlFlags::RSYN;
        if matches!(
            self.state,
            State::FinWait1 | State::Closing | State::LastAck
        ) {
            // Our FIN is still unacknowledged; keep its bit alive.
            flags |= ControlFlags::FIN;
        }
        self.queue_and_push(
            now,
            SentControl {
                verno,
                flags,
                conn_ack: false,
                payload: Bytes::new(),
                when: now,
                retransmitted: false,
            },
        );
    }

    /// Pure acknowledgements carry `snd.nxt` without consuming it and are
    /// never queued for retransmission
    fn send_ack(&mut self) {
        let builder = self.builder(ControlFlags::ACK, false, self.snd.nxt);
        let contents = builder.encode(&[]);
        trace!(flow = %self.local_flowid, ackno = self.rcv.nxt, "sending ACK");
        self.push_direct(contents);
    }

    /// Answer a protocol violation with a reset built from the offending
    /// packet, then drop it
    ///
    /// The reply goes back to the packet's network source; the flow may not
    /// have an established peer address (listeners, closed flows).
    fn send_reset(&mut self, remote: Ipv4Addr, device: DeviceId, ctx: &SalContext) {
        if ctx.flags.contains(ControlFlags::RST) {
            return;
        }
        let syn = ctx.flags.contains(ControlFlags::SYN) as u32;
        let fin = ctx.flags.contains(ControlFlags::FIN) as u32;
        let (flags, verno, ackno) = if ctx.flags.contains(ControlFlags::ACK) {
            (ControlFlags::RST, ctx.ackno, 0)
        } else {
            (
                ControlFlags::RST | ControlFlags::ACK,
                0,
                ctx.verno.wrapping_add(syn).wrapping_add(fin),
            )
        };
        let builder = HeaderBuilder {
            src_flowid: ctx.dst_flowid,
            dst_flowid: ctx.src_flowid,
            protocol: ctx.protocol,
            flags,
            conn_ack: false,
            verno,
            ackno,
            nonce: ctx.nonce.unwrap_or_default(),
            conn_srvid: None,
            datagram_srvids: None,
            source: Vec::new(),
        };
        debug!(flow = %self.local_flowid, "sending RST");
        let contents = builder.encode(&[]);
        self.transmits.push_back(Transmit {
            destination: remote,
            device: Some(device),
            source: None,
            contents: contents.into(),
        });
    }

    /// Queue a control packet for retransmission and transmit it
    fn queue_and_push(&mut self, now: Instant, ctrl: SentControl) {
        self.ctrl_queue.push_replacing(ctrl);
        self.snd.una = self.ctrl_queue.una().unwrap();
        self.timers[Timer::Retransmit] = Some(now + self.rtt.rto());
        self.write_xmit(now);
    }

    /// Transmit the queue head if the send window allows
    fn write_xmit(&mut self, now: Instant) {
        if self.snd.nxt.wrapping_sub(self.snd.una) > self.snd.wnd {
            trace!("send window exhausted");
            return;
        }
        let Some(head) = self.ctrl_queue.head_mut() else {
            return;
        };
        head.when = now;
        let (flags, conn_ack, verno, payload) =
            (head.flags, head.conn_ack, head.verno, head.payload.clone());
        let builder = self.builder(flags, conn_ack, verno);
        let contents = builder.encode(&payload);
        // A known peer address short-circuits resolution; only unresolved
        // flows (the initial SYN) go through the service table.
        if self.remote.is_some() {
            self.push_direct(contents);
        } else if let Some(peer) = self.peer_srvid {
            let len = payload.len();
            if let Err(err) = self.transmit_resolved(&peer, contents, len) {
                debug!(%err, "resolution failed, awaiting retransmit");
            }
        }
    }

    /// Send directly to the established peer address
    ///
    /// During a migration handshake, control traffic follows the peer to its
    /// new address before completion.
    fn push_direct(&mut self, contents: Vec<u8>) {
        let destination = match self.sal_state {
            SalState::RsynRecv | SalState::RsynSentRecv => {
                self.mig_remote.or(self.remote)
            }
            _ => self.remote,
        };
        let Some(destination) = destination else {
            debug!("no destination for direct transmit");
            return;
        };
        let device = self.mig_device.or(self.device);
        self.transmits.push_back(Transmit {
            destination,
            device,
            source: None,
            contents: contents.into(),
        });
    }

    /// Resolve `dest` through the service table and fan the packet out
    ///
    /// One target is drawn by anycast unless the set is multicast; the
    /// packet is duplicated for every target but the last. A failure on one
    /// target does not abort the remainder.
    fn transmit_resolved(
        &mut self,
        dest: &ServiceId,
        contents: Vec<u8>,
        payload_len: usize,
    ) -> Result<(), SendError> {
        use crate::service::MatchMode;

        let Some(entry) = self.table.find(dest, MatchMode::Any) else {
            debug!(service = %dest, "service lookup failed");
            self.table.inc_stats(-1, -(payload_len as i64));
            return Err(SendError::Unresolvable);
        };
        let mut sent = 0;
        {
            let mut iter = entry.resolve(ResolveMode::Anycast, &mut self.rng);
            let mut target = iter.next();
            if target.is_none() {
                iter.inc_stats(-1, -(payload_len as i64));
                return Err(SendError::Unresolvable);
            }
            iter.inc_stats(1, payload_len as i64);
            while let Some(current) = target {
                target = iter.next();
                match current {
                    Target::Forward { addr, device } => {
                        self.transmits.push_back(Transmit {
                            destination: addr,
                            device: Some(device),
                            source: None,
                            contents: contents.clone().into(),
                        });
                        sent += 1;
                    }
                    Target::Demux(_) => {
                        // Local delivery bounces off the loopback path.
                        self.transmits.push_back(Transmit {
                            destination: Ipv4Addr::LOCALHOST,
                            device: None,
                            source: None,
                            contents: contents.clone().into(),
                        });
                        sent += 1;
                    }
                    Target::Delay => {
                        trace!("target delays packet");
                    }
                    Target::Drop => {
                        trace!("target drops packet");
                    }
                }
            }
        }
        if sent == 0 {
            return Err(SendError::Unresolvable);
        }
        Ok(())
    }

    // Timers

    fn on_retransmit_timeout(&mut self, now: Instant) {
        if self.ctrl_queue.is_empty() || self.state == State::Closed {
            return;
        }
        if self.retransmits >= self.config.max_retransmits {
            debug!(flow = %self.local_flowid, "retransmit limit reached, closing");
            self.error = Some(ConnectionError::TimedOut);
            self.events.push_back(Event::ConnectionLost {
                reason: ConnectionError::TimedOut,
            });
            self.done();
            return;
        }
        if let Some(head) = self.ctrl_queue.head_mut() {
            head.retransmitted = true;
        }
        trace!(
            flow = %self.local_flowid,
            backoff = self.backoff,
            retransmits = self.retransmits,
            "retransmit timeout"
        );
        self.write_xmit(now);
        self.backoff += 1;
        self.retransmits += 1;
        self.timers[Timer::Retransmit] = Some(now + self.rtt.backed_off_rto(self.backoff));
    }

    fn on_keepalive_timeout(&mut self, now: Instant) {
        if self.state != State::Connected {
            return;
        }
        trace!(flow = %self.local_flowid, "keepalive probe");
        self.send_ack();
        self.arm_keepalive(now);
    }

    fn arm_keepalive(&mut self, now: Instant) {
        if let Some(interval) = self.config.keepalive_interval {
            self.timers[Timer::KeepAlive] = Some(now + interval);
        }
    }

    /// Rearm or clear the retransmit timer after a queue change
    fn rearm_retransmit(&mut self, now: Instant) {
        if self.ctrl_queue.is_empty() {
            self.timers[Timer::Retransmit] = None;
        } else {
            self.timers[Timer::Retransmit] = Some(now + self.rtt.rto());
        }
    }

    /// Enter a lingering teardown state
    ///
    /// The linger is floored at 3.5 times the current retransmission
    /// timeout, so a final acknowledgement still has a chance to arrive.
    fn enter_lingering(&mut self, state: State, linger: Duration, now: Instant) {
        let floor = (self.rtt.rto() * 7) / 2;
        let timeout = linger.max(floor);
        trace!(flow = %self.local_flowid, from = %self.state, to = %state, ?timeout, "lingering");
        self.state = state;
        self.timers[Timer::TimeWait] = Some(now + timeout);
    }

    /// Release the flow: terminal state, timers stopped, endpoint notified
    fn done(&mut self) {
        if self.state == State::Closed {
            return;
        }
        debug!(flow = %self.local_flowid, "flow released");
        self.state = State::Closed;
        for timer in Timer::VALUES {
            self.timers[timer] = None;
        }
        self.endpoint_events.push_back(EndpointEventInner::Drained);
    }
}

/// Events of interest to the application
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The handshake completed and the flow is established
    Connected,
    /// A listener has a completed connection ready to `accept`
    Incoming,
    /// Transport payload arrived
    Payload {
        /// The payload bytes, SAL header stripped
        data: Bytes,
        /// Service identifier of the sender, when one is known
        source: Option<ServiceId>,
    },
    /// The peer closed its half of the flow
    PeerClosed,
    /// The flow migrated to a new peer address or interface
    Migrated {
        /// The active peer address after migration
        remote: Ipv4Addr,
        /// The active interface after migration
        device: Option<DeviceId>,
    },
    /// The flow died with an error
    ConnectionLost {
        /// Why it died
        reason: ConnectionError,
    },
}

/// Reasons a flow was lost, surfaced with [`Event::ConnectionLost`]
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConnectionError {
    /// The peer rejected the connection attempt
    #[error("connection refused")]
    ConnectionRefused,
    /// The peer aborted an established flow
    #[error("connection reset")]
    ConnectionReset,
    /// The peer reset a flow it had already half-closed
    #[error("broken pipe")]
    BrokenPipe,
    /// Too many consecutive retransmissions went unanswered
    #[error("timed out")]
    TimedOut,
}

/// Errors from the sending entry points
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum SendError {
    /// The flow is not in a state that permits this operation
    #[error("flow not in a sendable state")]
    InvalidState,
    /// The destination service could not be resolved to any target
    #[error("service could not be resolved")]
    Unresolvable,
}

#[derive(Debug)]
struct AckError;
