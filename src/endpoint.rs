//! The main entry point to the library
//!
//! An `Endpoint` performs no I/O. It consumes raw inbound packets via
//! [`Endpoint::handle`], dispatching each to the owning flow — by flow
//! identifier when one is established, and otherwise by resolving the
//! packet's service identifier through the shared [`ServiceTable`]. Packets
//! that resolve to a forward target are re-emitted (with the local hop
//! recorded in the Source extension) via [`Endpoint::poll_transmit`] without
//! ever entering a connection's state machine.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::packet::{ControlFlags, SalContext};
use crate::service::{
    MatchMode, ResolveMode, ServiceError, ServiceTable, SocketRef, Target, TargetKey,
};
use crate::shared::{
    Config, ConnectionEvent, ConnectionEventInner, EndpointEvent, EndpointEventInner,
};
use crate::{DeviceId, FlowId, Protocol, ServiceId, Transmit};

/// Internal identifier for a flow known to an [`Endpoint`]
///
/// References are invalidated when the endpoint learns the flow has drained.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FlowHandle(pub usize);

impl From<FlowHandle> for usize {
    fn from(x: FlowHandle) -> Self {
        x.0
    }
}

/// Endpoint-side bookkeeping for one connection
#[derive(Debug, Default)]
struct FlowMeta {
    /// Flow identifiers routed to this connection; listeners also collect
    /// the identifiers of pending children
    flowids: Vec<FlowId>,
    /// Service registration to withdraw when the flow drains
    registered: Option<(ServiceId, usize, Protocol)>,
}

/// Demultiplexes inbound packets onto flows and forwards non-local traffic
pub struct Endpoint {
    config: Arc<Config>,
    table: Arc<ServiceTable>,
    rng: StdRng,
    flows: FxHashMap<FlowId, FlowHandle>,
    connections: Slab<FlowMeta>,
    /// Local address per interface, for Source-extension bookkeeping
    devices: FxHashMap<DeviceId, Ipv4Addr>,
    transmits: VecDeque<Transmit>,
}

/// Outcome of processing one inbound packet
#[derive(Debug)]
pub enum DatagramEvent {
    /// The packet belongs to `FlowHandle`; hand the event to its
    /// `Connection`
    ConnectionEvent(FlowHandle, ConnectionEvent),
    /// The packet resolved to a delay target; queue it externally and
    /// re-resolve later
    Delayed(Bytes),
}

impl Endpoint {
    /// Create an endpoint resolving through `table`
    pub fn new(config: Arc<Config>, table: Arc<ServiceTable>) -> Self {
        Self::with_rng(config, table, StdRng::from_entropy())
    }

    pub(crate) fn with_rng(config: Arc<Config>, table: Arc<ServiceTable>, rng: StdRng) -> Self {
        Self {
            config,
            table,
            rng,
            flows: FxHashMap::default(),
            connections: Slab::new(),
            devices: FxHashMap::default(),
            transmits: VecDeque::new(),
        }
    }

    /// The table this endpoint resolves through
    pub fn table(&self) -> &Arc<ServiceTable> {
        &self.table
    }

    /// Record the local address of an interface
    ///
    /// Needed before packets can be forwarded out of or into `device`.
    pub fn set_device_address(&mut self, device: DeviceId, addr: Ipv4Addr) {
        self.devices.insert(device, addr);
    }

    /// Handle an interface going away
    ///
    /// Drops the address registration and removes every forward target bound
    /// to the device from the service table. Returns the number of targets
    /// removed.
    pub fn device_down(&mut self, device: DeviceId) -> usize {
        self.devices.remove(&device);
        self.table.remove_by_device(device)
    }

    /// Packets generated by forwarding, to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Process an inbound packet, received on `device` from `remote`
    ///
    /// The data must start at the SAL header; the outer network-layer header
    /// is the caller's concern.
    pub fn handle(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        device: DeviceId,
        data: BytesMut,
    ) -> Option<DatagramEvent> {
        let ctx = match SalContext::parse(data.freeze()) {
            Ok(ctx) => ctx,
            Err(err) => {
                trace!(%err, "dropping malformed packet");
                self.table.inc_stats(-1, 0);
                return None;
            }
        };
        let local = self.devices.get(&device).copied().unwrap_or(Ipv4Addr::UNSPECIFIED);

        // A SYN without ACK can only demultiplex on a service identifier.
        let initial_syn = ctx.flags.contains(ControlFlags::SYN)
            && !ctx.flags.contains(ControlFlags::ACK);
        if !initial_syn {
            if let Some(&handle) = self.flows.get(&ctx.dst_flowid) {
                return Some(DatagramEvent::ConnectionEvent(
                    handle,
                    ConnectionEvent(ConnectionEventInner::Datagram {
                        now,
                        remote,
                        local,
                        device,
                        ctx,
                    }),
                ));
            }
            trace!(flow = %ctx.dst_flowid, "no matching flow");
        }

        let Some(srvid) = ctx.conn_srvid.or(ctx.srv_dst) else {
            debug!("unresolvable packet without service identifier");
            self.table.inc_stats(-1, -(ctx.payload.len() as i64));
            return None;
        };

        if !self.config.forward {
            return self.demux_service(now, remote, local, device, &srvid, ctx);
        }
        self.resolve_service(now, remote, local, device, &srvid, ctx)
    }

    /// Demux-only resolution, used when forwarding is disabled
    fn demux_service(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        local: Ipv4Addr,
        device: DeviceId,
        srvid: &ServiceId,
        ctx: SalContext,
    ) -> Option<DatagramEvent> {
        trace!(service = %srvid, "demux on service identifier");
        let sock = self.table.find_socket(srvid, Some(ctx.protocol))?;
        if !self.connections.contains(sock.handle.0) {
            debug!(service = %srvid, "demux target references a dead flow");
            return None;
        }
        Some(DatagramEvent::ConnectionEvent(
            sock.handle,
            ConnectionEvent(ConnectionEventInner::Datagram {
                now,
                remote,
                local,
                device,
                ctx,
            }),
        ))
    }

    /// Full resolution: demux, forward, delay, or drop
    fn resolve_service(
        &mut self,
        now: Instant,
        remote: Ipv4Addr,
        local: Ipv4Addr,
        device: DeviceId,
        srvid: &ServiceId,
        ctx: SalContext,
    ) -> Option<DatagramEvent> {
        trace!(service = %srvid, "resolving inbound packet");
        let data_len = ctx.payload.len() as i64;
        let Some(entry) = self.table.find(srvid, MatchMode::Any) else {
            debug!(service = %srvid, "no matching service entry");
            self.table.inc_stats(-1, -data_len);
            return None;
        };

        let mut demux = None;
        let mut delayed = false;
        let mut handled = 0u32;
        {
            let mut iter = entry.resolve(ResolveMode::Anycast, &mut self.rng);
            let mut target = iter.next();
            if target.is_none() {
                iter.inc_stats(-1, -data_len);
                return None;
            }
            iter.inc_stats(1, data_len);
            while let Some(current) = target {
                target = iter.next();
                match current {
                    Target::Demux(sock) => {
                        if self.connections.contains(sock.handle.0) {
                            demux = Some(sock);
                            handled += 1;
                        } else {
                            debug!(service = %srvid, "demux target references a dead flow");
                        }
                    }
                    Target::Forward { addr, device: out } => {
                        if let Some(contents) = self.forwarded_bytes(&ctx, remote, local) {
                            trace!(dst = %addr, device = %out, "forwarding");
                            self.transmits.push_back(Transmit {
                                destination: addr,
                                device: Some(out),
                                source: None,
                                contents: contents.into(),
                            });
                            handled += 1;
                        }
                    }
                    Target::Delay => {
                        delayed = true;
                        handled += 1;
                    }
                    Target::Drop => {}
                }
            }
            if handled == 0 {
                iter.inc_stats(-1, -data_len);
            }
        }

        if let Some(sock) = demux {
            return Some(DatagramEvent::ConnectionEvent(
                sock.handle,
                ConnectionEvent(ConnectionEventInner::Datagram {
                    now,
                    remote,
                    local,
                    device,
                    ctx,
                }),
            ));
        }
        if delayed {
            return Some(DatagramEvent::Delayed(Bytes::from(ctx.reencode(&ctx.source))));
        }
        None
    }

    /// Rebuild a packet for forwarding, recording this hop in its Source
    /// extension
    ///
    /// Returns `None` when the local address is already on the recorded path
    /// (a resolution loop) or no address is known for the receiving
    /// interface. The SAL checksum is recomputed; transport-payload
    /// checksums are the I/O layer's concern.
    fn forwarded_bytes(
        &self,
        ctx: &SalContext,
        packet_src: Ipv4Addr,
        local: Ipv4Addr,
    ) -> Option<Vec<u8>> {
        if local == Ipv4Addr::UNSPECIFIED {
            debug!("no local address for receiving interface");
            return None;
        }
        let mut source = ctx.source.clone();
        if source.is_empty() {
            source.push(packet_src);
            source.push(local);
        } else if source.contains(&local) {
            debug!("local address already on path, possible loop");
            return None;
        } else {
            source.push(local);
        }
        Some(ctx.reencode(&source))
    }

    /// Process an event from a connection associated with `handle`
    pub fn handle_event(&mut self, handle: FlowHandle, event: EndpointEvent) {
        match event.0 {
            EndpointEventInner::Drained => {
                if !self.connections.contains(handle.0) {
                    return;
                }
                let meta = self.connections.remove(handle.0);
                for flowid in &meta.flowids {
                    self.flows.remove(flowid);
                }
                if let Some((srvid, prefix_len, protocol)) = meta.registered {
                    let _ = self.table.remove_target(
                        &srvid,
                        prefix_len,
                        &TargetKey::Demux(Some(protocol)),
                    );
                }
                trace!(?handle, "flow state freed");
            }
            EndpointEventInner::FlowOpened(flowid) => {
                self.flows.insert(flowid, handle);
                if let Some(meta) = self.connections.get_mut(handle.0) {
                    meta.flowids.push(flowid);
                }
            }
        }
    }

    /// Initiate a connection to `peer_srvid`
    ///
    /// The destination is resolved through the service table at transmit
    /// time, and re-resolved on every retransmission.
    pub fn connect(
        &mut self,
        now: Instant,
        peer_srvid: ServiceId,
        protocol: Protocol,
    ) -> (FlowHandle, Connection) {
        let flowid = self.alloc_flowid();
        let handle = FlowHandle(self.connections.insert(FlowMeta {
            flowids: vec![flowid],
            registered: None,
        }));
        self.flows.insert(flowid, handle);
        let conn = Connection::new_client(
            self.config.clone(),
            self.table.clone(),
            flowid,
            None,
            peer_srvid,
            protocol,
            StdRng::seed_from_u64(self.rng.gen()),
            now,
        );
        (handle, conn)
    }

    /// Register a listener for `srvid` and return its flow
    ///
    /// Inserts a demux target under `(srvid, prefix_len)`; fails with
    /// [`ServiceError::AddressInUse`] if one is already registered for this
    /// protocol.
    pub fn listen(
        &mut self,
        srvid: ServiceId,
        prefix_len: usize,
        protocol: Protocol,
    ) -> Result<(FlowHandle, Connection), ServiceError> {
        self.bind(srvid, prefix_len, protocol, true)
    }

    /// Register an unconnected datagram flow bound to `srvid`
    pub fn bind_datagram(
        &mut self,
        srvid: ServiceId,
        prefix_len: usize,
        protocol: Protocol,
    ) -> Result<(FlowHandle, Connection), ServiceError> {
        self.bind(srvid, prefix_len, protocol, false)
    }

    fn bind(
        &mut self,
        srvid: ServiceId,
        prefix_len: usize,
        protocol: Protocol,
        listen: bool,
    ) -> Result<(FlowHandle, Connection), ServiceError> {
        let flowid = self.alloc_flowid();
        let handle = FlowHandle(self.connections.insert(FlowMeta {
            flowids: vec![flowid],
            registered: Some((srvid, prefix_len, protocol)),
        }));
        if let Err(err) = self.table.add(
            &srvid,
            prefix_len,
            0,
            0,
            1,
            Target::Demux(SocketRef { handle, protocol }),
        ) {
            self.connections.remove(handle.0);
            return Err(err);
        }
        self.flows.insert(flowid, handle);
        let rng = StdRng::seed_from_u64(self.rng.gen());
        let conn = if listen {
            Connection::new_listen(
                self.config.clone(),
                self.table.clone(),
                flowid,
                srvid,
                protocol,
                rng,
            )
        } else {
            Connection::new_datagram(
                self.config.clone(),
                self.table.clone(),
                flowid,
                srvid,
                protocol,
                rng,
            )
        };
        Ok((handle, conn))
    }

    /// Promote an accepted child to its own handle
    ///
    /// Call after taking a connection from a listener's `accept`; subsequent
    /// packets for `flowid` are then routed to the returned handle instead
    /// of the listener.
    pub fn accepted(&mut self, flowid: FlowId) -> FlowHandle {
        if let Some(&old) = self.flows.get(&flowid) {
            if let Some(meta) = self.connections.get_mut(old.0) {
                meta.flowids.retain(|&id| id != flowid);
            }
        }
        let handle = FlowHandle(self.connections.insert(FlowMeta {
            flowids: vec![flowid],
            registered: None,
        }));
        self.flows.insert(flowid, handle);
        handle
    }

    /// Number of flows known to this endpoint
    pub fn open_flows(&self) -> usize {
        self.connections.len()
    }

    fn alloc_flowid(&mut self) -> FlowId {
        loop {
            let id = FlowId(self.rng.gen());
            if id.0 != 0 && !self.flows.contains_key(&id) {
                return id;
            }
        }
    }
}
