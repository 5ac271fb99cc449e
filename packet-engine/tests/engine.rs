//! End-to-end tests for the packet engine over the in-memory simulator.
//!
//! Each test wires two engines to one [`SimNetwork`], opens channels
//! between them and checks what the application sees on both ends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use packet_engine::packet::{flags, HEADER_LEN};
use packet_engine::simulator::{drop_first_copy_of_odd_seqs, DropRule};
use packet_engine::{
    ChannelState, CloseReason, EngineConfig, EngineError, ExpiredSendPolicy, Packet, PacketEngine,
    PacketStream, PacketTransport, SimNetwork, SimTransport, SimulatorConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const STEP: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn network(mtu: usize) -> SimNetwork {
    SimNetwork::new(SimulatorConfig {
        mtu,
        ..SimulatorConfig::default()
    })
}

/// Two engines on one network. The returned transports are clones of the
/// ones the engines own.
fn engine_pair(
    net: &SimNetwork,
    client_cfg: EngineConfig,
    server_cfg: EngineConfig,
) -> (
    PacketEngine<SimTransport>,
    SimTransport,
    PacketEngine<SimTransport>,
    SimTransport,
) {
    let ct = net.endpoint();
    let st = net.endpoint();
    let client = PacketEngine::start(client_cfg, ct.clone()).expect("start client");
    let server = PacketEngine::start(server_cfg, st.clone()).expect("start server");
    (client, ct, server, st)
}

async fn open(
    client: &PacketEngine<SimTransport>,
    server: &PacketEngine<SimTransport>,
    server_addr: &SimTransport,
) -> (PacketStream<SimTransport>, PacketStream<SimTransport>) {
    let (c, s) = tokio::join!(
        client.connect(server_addr.local_dest()),
        server.accept(Some(STEP))
    );
    (c.expect("connect"), s.expect("accept"))
}

/// Read exactly `len` bytes.
async fn read_exact(stream: &PacketStream<SimTransport>, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 256];
    while out.len() < len {
        let want = (len - out.len()).min(buf.len());
        let n = stream
            .pull_bytes(&mut buf[..want], Some(STEP))
            .await
            .expect("pull");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

async fn wait_closed(stream: &PacketStream<SimTransport>) {
    let deadline = Instant::now() + STEP;
    while stream.state() != ChannelState::Closed {
        assert!(Instant::now() < deadline, "channel never closed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn drop_data_packets() -> DropRule {
    Box::new(|buf: &[u8]| buf.len() >= HEADER_LEN && buf[9] & flags::CONTROL == 0)
}

/// Loses the first transmission of data packet 0, nothing else.
fn drop_first_data_packet() -> DropRule {
    let mut dropped = false;
    Box::new(move |buf: &[u8]| {
        let hit = !dropped
            && buf.len() >= HEADER_LEN
            && buf[9] & flags::CONTROL == 0
            && u16::from_le_bytes([buf[4], buf[5]]) == 0;
        dropped |= hit;
        hit
    })
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_world_small_mtu() {
    init_logging();
    let net = network(64);
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    assert_eq!(client.mtu(), 64);

    let (c, s) = open(&client, &server, &st).await;
    assert_eq!(c.state(), ChannelState::Open);
    assert_eq!(s.state(), ChannelState::Open);
    assert_eq!(c.channel_id(), s.channel_id());

    assert_eq!(c.push_bytes(b"HELLO WORLD").await.unwrap(), 11);
    let mut buf = [0u8; 64];
    let n = s.pull_bytes(&mut buf, Some(STEP)).await.unwrap();
    assert_eq!(&buf[..n], b"HELLO WORLD");

    // And back the other way.
    s.push_bytes(b"hi").await.unwrap();
    assert_eq!(read_exact(&c, 2).await, b"hi");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn minimum_mtu_fragments_payload() {
    init_logging();
    let net = network(24);
    let wire: Arc<Mutex<BTreeMap<u16, Vec<u8>>>> = Arc::default();
    {
        let wire = Arc::clone(&wire);
        net.set_drop_rule(Some(Box::new(move |buf: &[u8]| {
            if buf[9] & flags::CONTROL == 0 {
                let seq = u16::from_le_bytes([buf[4], buf[5]]);
                wire.lock().unwrap().insert(seq, buf[HEADER_LEN..].to_vec());
            }
            false
        })));
    }
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;
    assert_eq!(c.mtu(), 24);

    assert_eq!(c.push_bytes(b"abcdefghijklmnopqrst").await.unwrap(), 20);
    s.source_event().wait().await;
    // Let the remaining fragments land so one pull sees all of them.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut buf = [0u8; 100];
    let n = s.pull_bytes(&mut buf, Some(STEP)).await.unwrap();
    assert_eq!(&buf[..n], b"abcdefghijklmnopqrst");

    let payloads: Vec<Vec<u8>> = wire.lock().unwrap().values().cloned().collect();
    assert_eq!(payloads, vec![b"abcdefgh".to_vec(), b"ijklmnop".to_vec(), b"qrst".to_vec()]);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn lost_odd_packets_are_retransmitted_in_order() {
    init_logging();
    let net = network(32);
    net.set_drop_rule(Some(drop_first_copy_of_odd_seqs()));
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;

    let data: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 251) as u8).collect();
    let writer = {
        let c = c.clone();
        let data = data.clone();
        tokio::spawn(async move { c.push_bytes(&data).await })
    };
    let got = tokio::time::timeout(Duration::from_secs(30), read_exact(&s, data.len()))
        .await
        .expect("transfer stalled");
    assert_eq!(got, data);
    assert_eq!(writer.await.unwrap().unwrap(), 1024);

    // 1024 bytes at 16 per packet is 64 packets; every odd one went twice.
    let m = client.metrics();
    assert!(m.retransmissions >= 32, "only {} retransmissions", m.retransmissions);
    assert!(net.stats().dropped >= 32);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn expired_packets_are_never_delivered() {
    init_logging();
    let net = network(1472);
    let (client, ct, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;

    ct.stall();
    assert_eq!(c.push_bytes_with_ttl(b"stale!!!", 100).await.unwrap(), 8);
    tokio::time::sleep(Duration::from_millis(500)).await;
    ct.resume();

    let mut buf = [0u8; 16];
    let err = s
        .pull_bytes(&mut buf, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout), "{err:?}");
    assert_eq!(client.metrics().tx_ttl_drops, 1);

    // The channel still works afterwards.
    c.push_bytes(b"fresh").await.unwrap();
    assert_eq!(read_exact(&s, 5).await, b"fresh");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn expired_send_can_surface_as_would_block() {
    init_logging();
    let net = network(1472);
    let cfg = EngineConfig::default().with_expired_send_policy(ExpiredSendPolicy::SurfaceWouldBlock);
    let (client, ct, server, st) = engine_pair(&net, cfg, EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;

    ct.stall();
    c.push_bytes_with_ttl(b"stale", 100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    ct.resume();

    // Reported once, then the channel carries on.
    assert!(matches!(c.push_bytes(b"next").await, Err(EngineError::WouldBlock)));
    assert_eq!(c.push_bytes(b"next").await.unwrap(), 4);
    assert_eq!(read_exact(&s, 4).await, b"next");

    client.stop().await;
    server.stop().await;
}

// ---------------------------------------------------------------------------
// Many channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn thousand_channels_release_every_packet() {
    init_logging();
    let net = network(1472);
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let client = Arc::new(client);

    let openers: Vec<_> = (0..1000u32)
        .map(|i| {
            let client = Arc::clone(&client);
            let dest = st.local_dest();
            tokio::spawn(async move {
                let stream = client.connect(dest).await.expect("connect");
                stream.push_bytes(&[(i % 256) as u8]).await.expect("push");
                stream
            })
        })
        .collect();

    let mut accepted = Vec::with_capacity(1000);
    let mut received = 0u32;
    for _ in 0..1000 {
        let s = server.accept(Some(STEP)).await.expect("accept");
        assert_eq!(read_exact(&s, 1).await.len(), 1);
        received += 1;
        accepted.push(s);
    }
    assert_eq!(received, 1000);

    let mut opened = Vec::with_capacity(1000);
    for h in openers {
        opened.push(h.await.unwrap());
    }
    assert_eq!(client.channel_count(), 1000);
    assert_eq!(server.channel_count(), 1000);

    for c in &opened {
        c.close().await;
    }
    for s in &accepted {
        s.close().await;
    }
    let deadline = Instant::now() + STEP;
    while client.channel_count() + server.channel_count() > 0 {
        assert!(Instant::now() < deadline, "channels left open");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.stop().await;
    server.stop().await;
    for pool in [client.pool(), server.pool()] {
        assert_eq!(pool.used_count(), 0);
        assert!(pool.free_count() <= 1, "free list holds {}", pool.free_count());
    }
}

// ---------------------------------------------------------------------------
// Handshake and close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_peer_fails_handshake_after_retry_budget() {
    init_logging();
    let net = network(1472);
    let silent = net.endpoint();
    let client = PacketEngine::start(EngineConfig::default(), net.endpoint()).unwrap();

    let started = Instant::now();
    let err = client.connect(silent.local_dest()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, EngineError::HandshakeFailed), "{err:?}");
    assert!(elapsed >= Duration::from_millis(4000), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "took {elapsed:?}");
    assert_eq!(client.channel_count(), 0);
    client.stop().await;
}

#[tokio::test]
async fn peer_close_keeps_unread_data() {
    init_logging();
    let net = network(1472);
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;

    c.push_bytes(b"bye").await.unwrap();
    c.close().await;
    assert_eq!(c.state(), ChannelState::Closed);
    assert_eq!(c.close_reason(), Some(CloseReason::Local));
    assert!(matches!(
        c.push_bytes(b"more").await,
        Err(EngineError::ChannelClosed(CloseReason::Local))
    ));

    wait_closed(&s).await;
    assert_eq!(read_exact(&s, 3).await, b"bye");
    let mut buf = [0u8; 8];
    assert!(matches!(
        s.pull_bytes(&mut buf, Some(STEP)).await,
        Err(EngineError::ChannelClosed(CloseReason::Peer))
    ));
    assert_eq!(s.close_reason(), Some(CloseReason::Peer));
    assert_eq!(s.peer_close_reason(), Some(CloseReason::Local));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn stop_closes_channels_on_both_sides() {
    init_logging();
    let net = network(1472);
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;

    server.stop().await;
    assert!(matches!(server.accept(Some(STEP)).await, Err(EngineError::EngineStopped)));
    assert!(matches!(
        s.push_bytes(b"x").await,
        Err(EngineError::ChannelClosed(CloseReason::EngineStopped))
    ));

    let mut buf = [0u8; 8];
    assert!(matches!(
        c.pull_bytes(&mut buf, Some(STEP)).await,
        Err(EngineError::ChannelClosed(CloseReason::Peer))
    ));
    assert_eq!(c.peer_close_reason(), Some(CloseReason::EngineStopped));
    client.stop().await;
    assert!(matches!(
        client.connect(st.local_dest()).await,
        Err(EngineError::EngineStopped)
    ));
}

#[tokio::test]
async fn full_window_times_out_with_would_block() {
    init_logging();
    let net = network(1472);
    let cfg = EngineConfig::default().with_window_size(2);
    let (client, _, server, st) = engine_pair(&net, cfg, EngineConfig::default());
    let (mut c, _s) = open(&client, &server, &st).await;

    net.set_drop_rule(Some(drop_data_packets()));
    c.set_send_timeout(Some(Duration::from_millis(100)));
    c.push_bytes(b"a").await.unwrap();
    c.push_bytes(b"b").await.unwrap();
    assert!(!c.sink_event().is_set());
    assert!(matches!(c.push_bytes(b"c").await, Err(EngineError::WouldBlock)));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn send_timeout_covers_waiting_behind_another_push() {
    init_logging();
    let net = network(1472);
    let cfg = EngineConfig::default().with_window_size(1);
    let (client, _, server, st) = engine_pair(&net, cfg, EngineConfig::default());
    let (c, _s) = open(&client, &server, &st).await;
    net.set_drop_rule(Some(drop_data_packets()));

    // Two fragments into a one-packet window: this push parks on the second.
    let first = {
        let c = c.clone();
        tokio::spawn(async move { c.push_bytes(&pattern(2000)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.is_finished());

    let mut second = c.clone();
    second.set_send_timeout(Some(Duration::from_millis(100)));
    let started = Instant::now();
    let res = second.push_bytes(b"queued behind").await;
    let elapsed = started.elapsed();
    assert!(matches!(res, Err(EngineError::WouldBlock)), "{res:?}");
    assert!(elapsed < Duration::from_secs(1), "waited {elapsed:?}");

    client.stop().await;
    server.stop().await;
    let _ = first.await;
}

#[tokio::test]
async fn slow_reader_does_not_exhaust_sender() {
    init_logging();
    let net = network(64);
    let (client, _, server, st) = engine_pair(
        &net,
        EngineConfig::default().with_window_size(4),
        EngineConfig::default().with_rx_queue_limit(4),
    );
    let (c, s) = open(&client, &server, &st).await;

    let data = pattern(960);
    let writer = {
        let c = c.clone();
        let data = data.clone();
        tokio::spawn(async move { c.push_bytes(&data).await })
    };

    // Longer than the whole retry budget.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(c.state(), ChannelState::Open);

    let got = tokio::time::timeout(Duration::from_secs(30), read_exact(&s, data.len()))
        .await
        .expect("transfer stalled");
    assert_eq!(got, data);
    assert_eq!(writer.await.unwrap().unwrap(), 960);
    assert_eq!(client.metrics().exhausted, 0);
    assert!(server.metrics().rx_queue_full > 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn unknown_channel_ids_are_rejected() {
    init_logging();
    let net = network(1472);
    let client = PacketEngine::start(EngineConfig::default(), net.endpoint()).unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(
        client.push_bytes(42, b"x", 0).await,
        Err(EngineError::UnknownChannel(42))
    ));
    assert!(matches!(
        client.pull_bytes(42, &mut buf, None).await,
        Err(EngineError::UnknownChannel(42))
    ));
    assert!(matches!(client.close_channel(42).await, Err(EngineError::UnknownChannel(42))));
    client.stop().await;
}

#[tokio::test]
async fn engine_level_calls_by_channel_id() {
    init_logging();
    let net = network(1472);
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());

    let peer = client.transport().local_dest();
    let (id, accepted) = tokio::join!(
        client.create_channel(st.local_dest()),
        server.accept_channel(Some(peer), Some(STEP))
    );
    let id = id.unwrap();
    assert_eq!(accepted.unwrap(), id);

    assert_eq!(client.push_bytes(id, b"by id", 0).await.unwrap(), 5);
    let mut buf = [0u8; 16];
    let n = server.pull_bytes(id, &mut buf, Some(STEP)).await.unwrap();
    assert_eq!(&buf[..n], b"by id");

    client.close_channel(id).await.unwrap();
    assert!(matches!(client.stream(id), Err(EngineError::UnknownChannel(_))));

    client.stop().await;
    server.stop().await;
}

// ---------------------------------------------------------------------------
// Faulty network
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lossy_reordering_duplicating_network_delivers_intact() {
    init_logging();
    let net = SimNetwork::new(SimulatorConfig {
        mtu: 128,
        loss_rate: 0.1,
        reorder_rate: 0.2,
        duplicate_rate: 0.1,
        seed: 0xfeed,
        ..SimulatorConfig::default()
    });
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;

    let data = pattern(20_000);
    let writer = {
        let c = c.clone();
        let data = data.clone();
        tokio::spawn(async move { c.push_bytes(&data).await })
    };
    let got = tokio::time::timeout(Duration::from_secs(60), read_exact(&s, data.len()))
        .await
        .expect("transfer stalled");
    assert_eq!(got, data);
    assert_eq!(writer.await.unwrap().unwrap(), data.len());

    let sim = net.stats();
    assert!(sim.dropped > 0 && sim.reordered > 0 && sim.duplicated > 0, "{sim:?}");
    assert!(client.metrics().retransmissions > 0);
    assert!(server.metrics().duplicates > 0);
    assert_eq!(client.metrics().exhausted, 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn hole_in_sequence_triggers_fast_retransmit() {
    init_logging();
    let net = network(64);
    net.set_drop_rule(Some(drop_first_data_packet()));
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;

    // Eight 48-byte packets; the first one goes missing.
    let data = pattern(8 * 48);
    c.push_bytes(&data).await.unwrap();
    assert_eq!(read_exact(&s, data.len()).await, data);

    let m = client.metrics();
    assert_eq!(m.fast_retransmissions, 1);
    assert!(m.retransmissions >= 1);
    assert_eq!(net.stats().dropped, 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn corrupt_datagrams_are_counted_and_ignored() {
    init_logging();
    let net = network(1472);
    let (client, _, server, st) = engine_pair(&net, EngineConfig::default(), EngineConfig::default());
    let (c, s) = open(&client, &server, &st).await;
    let rogue = net.endpoint();
    let target = st.local_dest();

    // Shorter than a header.
    rogue.push_packet_bytes(b"junk", &target).await.unwrap();

    // A data packet for the open channel with one payload byte flipped.
    let mut forged = Packet::new(64);
    forged.chan_id = c.channel_id();
    forged.flags = flags::ACK_REQUIRED;
    forged.set_payload(b"evil");
    let mut wire = forged.marshal(tokio::time::Instant::now()).to_vec();
    wire[HEADER_LEN] ^= 0xff;
    rogue.push_packet_bytes(&wire, &target).await.unwrap();

    // Intact framing, but no such control message kind.
    let mut bogus = Packet::new(64);
    bogus.seq_num = 99;
    bogus.flags = flags::CONTROL;
    bogus.set_payload(&[1, 0, 0, 0, 0, 0, 0, 0]);
    rogue.push_packet_bytes(bogus.marshal(tokio::time::Instant::now()), &target).await.unwrap();

    let deadline = Instant::now() + STEP;
    loop {
        let m = server.metrics();
        if m.bad_crc == 1 && m.bad_format == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "counters never moved: {m:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    c.push_bytes(b"still fine").await.unwrap();
    assert_eq!(read_exact(&s, 10).await, b"still fine");
    assert_eq!(server.metrics().bad_crc, 1);

    client.stop().await;
    server.stop().await;
}
