use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, SeedableRng};

use super::*;
use crate::connection::SendError;
use crate::packet::{ControlFlags, HeaderBuilder, SalContext};

use util::*;

#[test]
fn handshake() {
    let mut pair = Pair::new(Config::default());
    let (client_ch, _listener_ch, server_ch) = pair.connect(srvid(1));
    assert!(pair.client.conn_mut(client_ch).is_connected());
    assert!(pair.server.conn_mut(server_ch).is_connected());
    // The SYN's acknowledgement seeds the estimator.
    assert!(pair.client.conn_mut(client_ch).smoothed_rtt().is_some());
    assert!(pair
        .client
        .conn_mut(client_ch)
        .remote_address()
        .is_some());
}

#[test]
fn data_transfer() {
    let mut pair = Pair::new(Config::default());
    let service = srvid(2);
    let (client_ch, _listener_ch, server_ch) = pair.connect(service);

    pair.client
        .conn_mut(client_ch)
        .send(Bytes::from_static(b"hello"))
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.server.conn_mut(server_ch).poll(),
        Some(Event::Payload {
            data: Bytes::from_static(b"hello"),
            source: Some(service),
        })
    );

    pair.server
        .conn_mut(server_ch)
        .send(Bytes::from_static(b"world"))
        .unwrap();
    pair.drive();
    assert!(matches!(
        pair.client.conn_mut(client_ch).poll(),
        Some(Event::Payload { ref data, .. }) if &data[..] == b"world"
    ));
}

#[test]
fn orderly_close() {
    let mut pair = Pair::new(Config::default());
    let (client_ch, _listener_ch, server_ch) = pair.connect(srvid(3));

    let now = pair.time;
    pair.client.conn_mut(client_ch).close(now);
    pair.settle();
    assert_eq!(
        pair.server.conn_mut(server_ch).poll(),
        Some(Event::PeerClosed)
    );

    let now = pair.time;
    pair.server.conn_mut(server_ch).close(now);
    pair.settle();
    assert_eq!(
        pair.client.conn_mut(client_ch).poll(),
        Some(Event::PeerClosed)
    );
    // The final ACK lands before any clock advance, so the passive closer is
    // already done; the active closer lingers in TIME-WAIT until the clock
    // runs.
    assert!(pair.server.conn_mut(server_ch).is_closed());
    assert!(!pair.client.conn_mut(client_ch).is_closed());
    pair.drive();
    assert!(pair.client.conn_mut(client_ch).is_closed());
}

#[test]
fn simultaneous_close() {
    let mut pair = Pair::new(Config::default());
    let (client_ch, _listener_ch, server_ch) = pair.connect(srvid(4));

    let now = pair.time;
    pair.client.conn_mut(client_ch).close(now);
    pair.server.conn_mut(server_ch).close(now);
    pair.drive();

    assert_eq!(
        pair.client.conn_mut(client_ch).poll(),
        Some(Event::PeerClosed)
    );
    assert_eq!(
        pair.server.conn_mut(server_ch).poll(),
        Some(Event::PeerClosed)
    );
    assert!(pair.client.conn_mut(client_ch).is_closed());
    assert!(pair.server.conn_mut(server_ch).is_closed());
}

#[test]
fn migration() {
    let mut pair = Pair::new(Config::default());
    let (client_ch, _listener_ch, server_ch) = pair.connect(srvid(5));

    let new_addr = Ipv4Addr::new(10, 0, 0, 3);
    let new_dev = DeviceId(3);
    pair.client.add_device(new_dev, new_addr);
    let now = pair.time;
    pair.client
        .conn_mut(client_ch)
        .migrate(now, new_dev)
        .unwrap();
    pair.drive();

    assert!(matches!(
        pair.client.conn_mut(client_ch).poll(),
        Some(Event::Migrated { .. })
    ));
    assert_eq!(
        pair.server.conn_mut(server_ch).poll(),
        Some(Event::Migrated {
            remote: new_addr,
            device: Some(SERVER_DEV),
        })
    );
    assert_eq!(
        pair.server.conn_mut(server_ch).remote_address(),
        Some(new_addr)
    );

    // The moved flow still carries data.
    pair.client
        .conn_mut(client_ch)
        .send(Bytes::from_static(b"after"))
        .unwrap();
    pair.drive();
    assert!(matches!(
        pair.server.conn_mut(server_ch).poll(),
        Some(Event::Payload { ref data, .. }) if &data[..] == b"after"
    ));
}

#[test]
fn listener_close_withdraws_registration() {
    let mut pair = Pair::new(Config::default());
    let service = srvid(6);
    let (_client_ch, listener_ch, _server_ch) = pair.connect(service);

    assert!(pair
        .server
        .endpoint
        .table()
        .find(&service, MatchMode::Local)
        .is_some());
    let now = pair.time;
    pair.server.conn_mut(listener_ch).close(now);
    pair.drive();
    assert!(pair
        .server
        .endpoint
        .table()
        .find(&service, MatchMode::Local)
        .is_none());
}

#[test]
fn unconnected_datagrams() {
    let mut pair = Pair::new(Config::default());
    let client_service = srvid(0x10);
    let server_service = srvid(0x20);

    pair.client
        .endpoint
        .table()
        .add(
            &server_service,
            ServiceId::BITS,
            0,
            0,
            1,
            Target::Forward {
                addr: SERVER_ADDR,
                device: CLIENT_DEV,
            },
        )
        .unwrap();
    let (server_ch, server_conn) = pair
        .server
        .endpoint
        .bind_datagram(server_service, ServiceId::BITS, Protocol::UDP)
        .unwrap();
    pair.server.connections.insert(server_ch, server_conn);
    let (client_ch, client_conn) = pair
        .client
        .endpoint
        .bind_datagram(client_service, ServiceId::BITS, Protocol::UDP)
        .unwrap();
    pair.client.connections.insert(client_ch, client_conn);

    pair.client
        .conn_mut(client_ch)
        .send_datagram(server_service, Bytes::from_static(b"dgram"))
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.server.conn_mut(server_ch).poll(),
        Some(Event::Payload {
            data: Bytes::from_static(b"dgram"),
            source: Some(client_service),
        })
    );

    // With no route for the reply direction, sending fails cleanly.
    assert_eq!(
        pair.server
            .conn_mut(server_ch)
            .send_datagram(client_service, Bytes::new()),
        Err(SendError::Unresolvable)
    );
}

#[test]
fn duplicate_listen_rejected() {
    let config = Arc::new(Config::default());
    let table = Arc::new(ServiceTable::new());
    let mut endpoint = Endpoint::with_rng(config, table, StdRng::seed_from_u64(3));
    let service = srvid(9);
    endpoint.listen(service, ServiceId::BITS, Protocol::TCP).unwrap();
    assert!(matches!(
        endpoint.listen(service, ServiceId::BITS, Protocol::TCP),
        Err(ServiceError::AddressInUse)
    ));
    // A different protocol may share the prefix.
    endpoint.listen(service, ServiceId::BITS, Protocol::UDP).unwrap();
}

#[test]
fn keepalive_probes_idle_flow() {
    let mut config = Config::default();
    config.keepalive_interval(Some(Duration::from_secs(2)));
    let mut pair = Pair::new(config);
    let (client_ch, _listener_ch, server_ch) = pair.connect(srvid(8));

    let received = pair.server.packets_received;
    pair.drive();
    assert!(pair.server.packets_received > received, "no probes seen");
    assert!(pair.client.conn_mut(client_ch).is_connected());
    assert!(pair.server.conn_mut(server_ch).is_connected());
}

// Scripted-peer tests: the remote end is hand-built packets, giving exact
// control over sequence numbers and nonces.

const PEER_FLOW: FlowId = FlowId(0xbeef);
const PEER_NONCE: Nonce = [9; NONCE_SIZE];

fn scripted_client() -> (Endpoint, Connection, FlowHandle, ServiceId, Instant) {
    subscribe();
    let config = Arc::new(Config::default());
    let table = Arc::new(ServiceTable::new());
    let service = srvid(0x77);
    table
        .add(
            &service,
            ServiceId::BITS,
            0,
            0,
            1,
            Target::Forward {
                addr: SERVER_ADDR,
                device: CLIENT_DEV,
            },
        )
        .unwrap();
    let mut endpoint = Endpoint::with_rng(config, table, StdRng::seed_from_u64(11));
    endpoint.set_device_address(CLIENT_DEV, CLIENT_ADDR);
    let now = Instant::now();
    let (ch, conn) = endpoint.connect(now, service, Protocol::TCP);
    (endpoint, conn, ch, service, now)
}

fn deliver(
    endpoint: &mut Endpoint,
    conn: &mut Connection,
    ch: FlowHandle,
    now: Instant,
    bytes: Vec<u8>,
) {
    match endpoint.handle(now, SERVER_ADDR, CLIENT_DEV, BytesMut::from(&bytes[..])) {
        Some(DatagramEvent::ConnectionEvent(handle, event)) => {
            assert_eq!(handle, ch);
            conn.handle_event(event);
        }
        other => panic!("packet not routed to flow: {:?}", other),
    }
}

fn peer_packet(flags: ControlFlags, verno: u32, ackno: u32, dst: FlowId) -> HeaderBuilder {
    HeaderBuilder {
        src_flowid: PEER_FLOW,
        dst_flowid: dst,
        protocol: Protocol::TCP,
        flags,
        conn_ack: false,
        verno,
        ackno,
        nonce: PEER_NONCE,
        conn_srvid: None,
        datagram_srvids: None,
        source: Vec::new(),
    }
}

/// Complete a handshake against a scripted peer with `verno` 500
fn establish() -> (Endpoint, Connection, FlowHandle, FlowId, u32, Instant) {
    let (mut endpoint, mut conn, ch, service, now) = scripted_client();
    let syn = conn.poll_transmit().expect("no SYN sent");
    let syn_ctx = SalContext::parse(Bytes::copy_from_slice(&syn.contents)).unwrap();
    assert!(syn_ctx.flags.contains(ControlFlags::SYN));
    assert_eq!(syn_ctx.conn_srvid, Some(service));
    let v = syn_ctx.verno;
    let flow = syn_ctx.src_flowid;

    let mut synack = peer_packet(
        ControlFlags::SYN | ControlFlags::ACK,
        500,
        v.wrapping_add(1),
        flow,
    );
    synack.conn_srvid = Some(service);
    deliver(&mut endpoint, &mut conn, ch, now, synack.encode(&[]));
    assert_eq!(conn.poll(), Some(Event::Connected));
    (endpoint, conn, ch, flow, v, now)
}

#[test]
fn handshake_sequencing_and_fin_ack() {
    let (mut endpoint, mut conn, ch, flow, v, now) = establish();

    // The handshake ACK echoes rcv.nxt = 501 and does not consume a
    // sequence number.
    let ack = conn.poll_transmit().unwrap();
    let ack_ctx = SalContext::parse(Bytes::copy_from_slice(&ack.contents)).unwrap();
    assert!(ack_ctx.is_pure_ack());
    assert_eq!(ack_ctx.verno, v.wrapping_add(1));
    assert_eq!(ack_ctx.ackno, 501);
    // Zero-latency round trip clamps to the 1 ms floor.
    assert_eq!(conn.smoothed_rtt(), Some(Duration::from_millis(1)));

    // The FIN consumes the sequence number the pure ACK did not.
    conn.close(now);
    let fin = conn.poll_transmit().unwrap();
    let fin_ctx = SalContext::parse(Bytes::copy_from_slice(&fin.contents)).unwrap();
    assert!(fin_ctx.flags.contains(ControlFlags::FIN));
    assert_eq!(fin_ctx.verno, v.wrapping_add(1));

    // FIN+ACK in one packet: straight to TIME-WAIT, acknowledging the FIN.
    let finack = peer_packet(
        ControlFlags::FIN | ControlFlags::ACK,
        501,
        v.wrapping_add(2),
        flow,
    );
    deliver(&mut endpoint, &mut conn, ch, now, finack.encode(&[]));
    assert_eq!(conn.poll(), Some(Event::PeerClosed));
    let ack2 = conn.poll_transmit().unwrap();
    let ack2_ctx = SalContext::parse(Bytes::copy_from_slice(&ack2.contents)).unwrap();
    assert!(ack2_ctx.is_pure_ack());
    assert_eq!(ack2_ctx.ackno, 502);

    // TIME-WAIT lingers, then the flow releases itself.
    assert!(!conn.is_closed());
    let deadline = conn.poll_timeout().expect("no linger armed");
    conn.handle_timeout(deadline);
    assert!(conn.is_closed());
    assert!(conn.poll_endpoint_events().unwrap().is_drained());
}

#[test]
fn timewait_reacks_duplicate_fin() {
    let (mut endpoint, mut conn, ch, flow, v, now) = establish();
    conn.close(now);
    while conn.poll_transmit().is_some() {}
    let finack = peer_packet(
        ControlFlags::FIN | ControlFlags::ACK,
        501,
        v.wrapping_add(2),
        flow,
    );
    deliver(&mut endpoint, &mut conn, ch, now, finack.encode(&[]));
    assert_eq!(conn.poll(), Some(Event::PeerClosed));
    while conn.poll_transmit().is_some() {}

    // Our ACK was "lost": the peer retransmits its FIN.
    let dup = peer_packet(
        ControlFlags::FIN | ControlFlags::ACK,
        501,
        v.wrapping_add(2),
        flow,
    );
    deliver(&mut endpoint, &mut conn, ch, now, dup.encode(&[]));
    let reack = conn.poll_transmit().expect("duplicate FIN not re-acked");
    let ctx = SalContext::parse(Bytes::copy_from_slice(&reack.contents)).unwrap();
    assert!(ctx.is_pure_ack());
    assert_eq!(ctx.ackno, 502);
    assert!(!conn.is_closed());
}

#[test]
fn connected_reset() {
    let (mut endpoint, mut conn, ch, flow, _v, now) = establish();
    while conn.poll_transmit().is_some() {}

    let rst = peer_packet(ControlFlags::RST, 501, 0, flow);
    deliver(&mut endpoint, &mut conn, ch, now, rst.encode(&[]));
    assert_eq!(
        conn.poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::ConnectionReset,
        })
    );
    assert_eq!(conn.error(), Some(ConnectionError::ConnectionReset));
    assert!(conn.is_closed());

    // A second reset against the closed flow is a no-op.
    let rst = peer_packet(ControlFlags::RST, 501, 0, flow);
    deliver(&mut endpoint, &mut conn, ch, now, rst.encode(&[]));
    assert_eq!(conn.poll(), None);
    assert!(conn.poll_transmit().is_none());
}

#[test]
fn connection_refused() {
    let (mut endpoint, mut conn, ch, _service, now) = scripted_client();
    let syn = conn.poll_transmit().unwrap();
    let syn_ctx = SalContext::parse(Bytes::copy_from_slice(&syn.contents)).unwrap();

    // Any version number is accepted while requesting.
    let rst = peer_packet(ControlFlags::RST | ControlFlags::ACK, 0, 0, syn_ctx.src_flowid);
    deliver(&mut endpoint, &mut conn, ch, now, rst.encode(&[]));
    assert_eq!(
        conn.poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::ConnectionRefused,
        })
    );
}

#[test]
fn out_of_sequence_verno_draws_reset() {
    let (mut endpoint, mut conn, ch, flow, _v, now) = establish();
    while conn.poll_transmit().is_some() {}

    // Far behind rcv.nxt = 501.
    let stale = peer_packet(ControlFlags::ACK, 10, 0, flow);
    deliver(&mut endpoint, &mut conn, ch, now, stale.encode(&[]));
    let out = conn.poll_transmit().expect("expected a RST");
    let ctx = SalContext::parse(Bytes::copy_from_slice(&out.contents)).unwrap();
    assert!(ctx.flags.contains(ControlFlags::RST));
    // No state was harmed.
    assert!(conn.is_connected());
}

#[test]
fn stale_and_ahead_acks_rejected() {
    let (mut endpoint, mut conn, ch, flow, v, now) = establish();
    while conn.poll_transmit().is_some() {}
    conn.close(now);
    while conn.poll_transmit().is_some() {}

    // ackno ahead of snd.nxt must not clear the queued FIN: the flow keeps
    // retransmitting and eventually times out instead of advancing.
    let ahead = peer_packet(ControlFlags::ACK, 501, v.wrapping_add(40), flow);
    deliver(&mut endpoint, &mut conn, ch, now, ahead.encode(&[]));
    assert!(conn.poll_timeout().is_some());
    // A valid ACK of the FIN still lands afterwards: send state was not
    // mutated by the invalid one.
    let good = peer_packet(ControlFlags::ACK, 501, v.wrapping_add(2), flow);
    deliver(&mut endpoint, &mut conn, ch, now, good.encode(&[]));
    // FinWait2 now; the peer's FIN completes the close.
    let finack = peer_packet(
        ControlFlags::FIN | ControlFlags::ACK,
        501,
        v.wrapping_add(2),
        flow,
    );
    deliver(&mut endpoint, &mut conn, ch, now, finack.encode(&[]));
    assert_eq!(conn.poll(), Some(Event::PeerClosed));
}

#[test]
fn connect_times_out_after_retry_limit() {
    let (_endpoint, mut conn, _ch, _service, _now) = scripted_client();
    let mut syns = 0;
    while let Some(x) = conn.poll_transmit() {
        let ctx = SalContext::parse(Bytes::copy_from_slice(&x.contents)).unwrap();
        assert!(ctx.flags.contains(ControlFlags::SYN));
        syns += 1;
    }
    loop {
        match conn.poll() {
            Some(Event::ConnectionLost { reason }) => {
                assert_eq!(reason, ConnectionError::TimedOut);
                break;
            }
            Some(_) => continue,
            None => {}
        }
        let deadline = conn.poll_timeout().expect("flow stalled without timer");
        conn.handle_timeout(deadline);
        while conn.poll_transmit().is_some() {
            syns += 1;
        }
    }
    // One initial transmission plus the configured number of retries.
    assert_eq!(syns, 11);
    assert!(conn.is_closed());
}

#[test]
fn duplicate_syn_answered_from_existing_request() {
    subscribe();
    let config = Arc::new(Config::default());
    let table = Arc::new(ServiceTable::new());
    let service = srvid(0x55);
    let mut endpoint = Endpoint::with_rng(config, table, StdRng::seed_from_u64(5));
    endpoint.set_device_address(SERVER_DEV, SERVER_ADDR);
    let (listener_ch, mut listener) = endpoint
        .listen(service, ServiceId::BITS, Protocol::TCP)
        .unwrap();
    let now = Instant::now();

    let syn = HeaderBuilder {
        src_flowid: PEER_FLOW,
        dst_flowid: FlowId(0),
        protocol: Protocol::TCP,
        flags: ControlFlags::SYN,
        conn_ack: false,
        verno: 100,
        ackno: 0,
        nonce: PEER_NONCE,
        conn_srvid: Some(service),
        datagram_srvids: None,
        source: Vec::new(),
    };

    let mut synacks = Vec::new();
    for _ in 0..2 {
        deliver(&mut endpoint, &mut listener, listener_ch, now, syn.encode(&[]));
        let out = listener.poll_transmit().expect("no SYN-ACK");
        synacks.push(SalContext::parse(Bytes::copy_from_slice(&out.contents)).unwrap());
    }
    // Same request answered twice; no new state allocated.
    assert_eq!(synacks[0].src_flowid, synacks[1].src_flowid);
    assert_eq!(synacks[0].verno, synacks[1].verno);
    assert_eq!(listener.poll(), None);

    // Completing the handshake still yields exactly one connection.
    let ack = HeaderBuilder {
        src_flowid: PEER_FLOW,
        dst_flowid: synacks[0].src_flowid,
        protocol: Protocol::TCP,
        flags: ControlFlags::ACK,
        conn_ack: true,
        verno: 101,
        ackno: synacks[0].verno.wrapping_add(1),
        nonce: PEER_NONCE,
        conn_srvid: Some(service),
        datagram_srvids: None,
        source: Vec::new(),
    };
    deliver(&mut endpoint, &mut listener, listener_ch, now, ack.encode(&[]));
    assert_eq!(listener.poll(), Some(Event::Incoming));
    let child = listener.accept().unwrap();
    assert!(child.is_connected());
    assert!(listener.accept().is_none());
}

#[test]
fn forwards_with_source_extension() {
    subscribe();
    let config = Arc::new(Config::default());
    let table = Arc::new(ServiceTable::new());
    let service = srvid(0x66);
    let forwarder = Ipv4Addr::new(10, 0, 0, 9);
    let next_hop = Ipv4Addr::new(10, 0, 0, 7);
    let dev = DeviceId(5);
    table
        .add(
            &service,
            ServiceId::BITS,
            0,
            0,
            1,
            Target::Forward {
                addr: next_hop,
                device: dev,
            },
        )
        .unwrap();
    let mut endpoint = Endpoint::with_rng(config, table, StdRng::seed_from_u64(7));
    endpoint.set_device_address(dev, forwarder);
    let now = Instant::now();

    let packet = HeaderBuilder {
        src_flowid: FlowId(0x1111),
        dst_flowid: FlowId(0),
        protocol: Protocol::UDP,
        flags: ControlFlags::default(),
        conn_ack: false,
        verno: 0,
        ackno: 0,
        nonce: [1; NONCE_SIZE],
        conn_srvid: None,
        datagram_srvids: Some((srvid(0x65), service)),
        source: Vec::new(),
    }
    .encode(b"payload");
    let origin = Ipv4Addr::new(10, 0, 0, 6);
    let out = endpoint.handle(now, origin, dev, BytesMut::from(&packet[..]));
    assert!(out.is_none());
    let fwd = endpoint.poll_transmit().expect("packet not forwarded");
    assert_eq!(fwd.destination, next_hop);
    assert_eq!(fwd.device, Some(dev));
    let ctx = SalContext::parse(Bytes::copy_from_slice(&fwd.contents)).unwrap();
    assert_eq!(ctx.source, vec![origin, forwarder]);
    assert_eq!(&ctx.payload[..], b"payload");

    // A packet that already routed through us is a loop: drop, no output.
    let looped = HeaderBuilder {
        src_flowid: FlowId(0x1111),
        dst_flowid: FlowId(0),
        protocol: Protocol::UDP,
        flags: ControlFlags::default(),
        conn_ack: false,
        verno: 0,
        ackno: 0,
        nonce: [1; NONCE_SIZE],
        conn_srvid: None,
        datagram_srvids: Some((srvid(0x65), service)),
        source: vec![origin, forwarder],
    }
    .encode(b"payload");
    let out = endpoint.handle(now, origin, dev, BytesMut::from(&looped[..]));
    assert!(out.is_none());
    assert!(endpoint.poll_transmit().is_none());
    assert!(endpoint.table().stats().packets_dropped > 0);
}

#[test]
fn malformed_packets_dropped_silently() {
    subscribe();
    let config = Arc::new(Config::default());
    let table = Arc::new(ServiceTable::new());
    let mut endpoint = Endpoint::with_rng(config, table, StdRng::seed_from_u64(1));
    let now = Instant::now();

    // Truncated, garbage, and checksum-corrupted packets all vanish.
    for bad in [
        vec![0u8; 3],
        vec![0xffu8; 64],
        {
            let mut ok = peer_packet(ControlFlags::ACK, 1, 1, FlowId(7)).encode(&[]);
            ok[0] ^= 0x80;
            ok
        },
    ] {
        assert!(endpoint
            .handle(now, SERVER_ADDR, SERVER_DEV, BytesMut::from(&bad[..]))
            .is_none());
        assert!(endpoint.poll_transmit().is_none());
    }
    assert_eq!(endpoint.table().stats().packets_dropped, 3);
}

#[test]
fn delay_target_hands_packet_back() {
    subscribe();
    let config = Arc::new(Config::default());
    let table = Arc::new(ServiceTable::new());
    let service = srvid(0x44);
    table
        .add(&service, ServiceId::BITS, 0, 0, 1, Target::Delay)
        .unwrap();
    let mut endpoint = Endpoint::with_rng(config, table, StdRng::seed_from_u64(2));
    endpoint.set_device_address(SERVER_DEV, SERVER_ADDR);
    let now = Instant::now();

    let packet = HeaderBuilder {
        src_flowid: FlowId(0x2222),
        dst_flowid: FlowId(0),
        protocol: Protocol::UDP,
        flags: ControlFlags::default(),
        conn_ack: false,
        verno: 0,
        ackno: 0,
        nonce: [0; NONCE_SIZE],
        conn_srvid: None,
        datagram_srvids: Some((srvid(0x43), service)),
        source: Vec::new(),
    }
    .encode(b"later");
    match endpoint.handle(now, CLIENT_ADDR, SERVER_DEV, BytesMut::from(&packet[..])) {
        Some(DatagramEvent::Delayed(bytes)) => {
            let ctx = SalContext::parse(bytes).unwrap();
            assert_eq!(&ctx.payload[..], b"later");
            assert_eq!(ctx.srv_dst, Some(service));
        }
        other => panic!("expected delayed packet, got {:?}", other),
    }

    // A drop rule discards outright.
    let drop_service = srvid(0x45);
    endpoint
        .table()
        .add(&drop_service, ServiceId::BITS, 0, 0, 1, Target::Drop)
        .unwrap();
    let packet = HeaderBuilder {
        src_flowid: FlowId(0x2222),
        dst_flowid: FlowId(0),
        protocol: Protocol::UDP,
        flags: ControlFlags::default(),
        conn_ack: false,
        verno: 0,
        ackno: 0,
        nonce: [0; NONCE_SIZE],
        conn_srvid: None,
        datagram_srvids: Some((srvid(0x43), drop_service)),
        source: Vec::new(),
    }
    .encode(b"gone");
    assert!(endpoint
        .handle(now, CLIENT_ADDR, SERVER_DEV, BytesMut::from(&packet[..]))
        .is_none());
    assert!(endpoint.poll_transmit().is_none());
}

#[test]
fn accept_backlog_limits_pending_requests() {
    subscribe();
    let mut config = Config::default();
    config.accept_backlog(1);
    let config = Arc::new(config);
    let table = Arc::new(ServiceTable::new());
    let service = srvid(0x88);
    let mut endpoint = Endpoint::with_rng(config, table, StdRng::seed_from_u64(4));
    endpoint.set_device_address(SERVER_DEV, SERVER_ADDR);
    let (listener_ch, mut listener) = endpoint
        .listen(service, ServiceId::BITS, Protocol::TCP)
        .unwrap();
    let now = Instant::now();

    for (i, answered) in [(1u32, true), (2, false)] {
        let syn = HeaderBuilder {
            src_flowid: FlowId(i),
            dst_flowid: FlowId(0),
            protocol: Protocol::TCP,
            flags: ControlFlags::SYN,
            conn_ack: false,
            verno: 100 + i,
            ackno: 0,
            nonce: [i as u8; NONCE_SIZE],
            conn_srvid: Some(service),
            datagram_srvids: None,
            source: Vec::new(),
        }
        .encode(&[]);
        deliver(&mut endpoint, &mut listener, listener_ch, now, syn);
        assert_eq!(listener.poll_transmit().is_some(), answered);
    }
}
