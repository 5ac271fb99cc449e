//! In-memory network simulator for deterministic testing.
//!
//! Real networks drop, reorder and duplicate datagrams. To exercise the
//! engine's recovery paths without depending on actual network conditions,
//! a [`SimNetwork`] connects any number of [`SimTransport`] endpoints and
//! applies a configurable fault model to every datagram in flight:
//!
//! | Fault        | Description                                            |
//! |--------------|--------------------------------------------------------|
//! | Packet loss  | Drop a datagram with probability `loss_rate`.          |
//! | Reordering   | Hold a datagram back for `reorder_delay`, letting later |
//! |              | ones overtake it.                                      |
//! | Duplication  | Deliver a datagram twice.                              |
//! | Drop rule    | Drop whatever a caller-supplied predicate selects.     |
//! | Stall        | Make one endpoint's sends fail with `Busy`.            |
//!
//! All randomness comes from one seeded RNG, so a failing run can be
//! replayed with the same seed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::event::Event;
use crate::packet::{flags, HEADER_LEN};
use crate::transport::{PacketDest, PacketTransport, PACKET_DEST_LEN};

/// Decides whether one datagram (full wire bytes) is dropped.
pub type DropRule = Box<dyn FnMut(&[u8]) -> bool + Send>;

type Datagram = (Vec<u8>, PacketDest);

/// Fault model. Probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Largest datagram an endpoint accepts.
    pub mtu: usize,
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is held back.
    pub reorder_rate: f64,
    /// How long held-back datagrams wait.
    pub reorder_delay: Duration,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: a transparent pass-through.
        Self {
            mtu: 1472,
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(20),
            duplicate_rate: 0.0,
            seed: 0x5eed,
        }
    }
}

/// Running totals of what the network did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub unreachable: u64,
}

struct NetInner {
    config: SimulatorConfig,
    rng: StdRng,
    endpoints: HashMap<PacketDest, mpsc::UnboundedSender<Datagram>>,
    rule: Option<DropRule>,
    stats: SimStats,
    next_id: u32,
}

// ---------------------------------------------------------------------------
// SimNetwork
// ---------------------------------------------------------------------------

/// A shared medium that endpoints send through.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetInner>>,
    mtu: usize,
}

impl SimNetwork {
    pub fn new(config: SimulatorConfig) -> Self {
        let mtu = config.mtu;
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(Mutex::new(NetInner {
                config,
                rng,
                endpoints: HashMap::new(),
                rule: None,
                stats: SimStats::default(),
                next_id: 1,
            })),
            mtu,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new endpoint with a fresh address.
    pub fn endpoint(&self) -> SimTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            let mut data = [0u8; PACKET_DEST_LEN];
            data[..4].copy_from_slice(&id.to_le_bytes());
            let addr = PacketDest::new(data);
            inner.endpoints.insert(addr, tx);
            addr
        };
        SimTransport {
            net: self.clone(),
            addr,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            stalled: Arc::new(AtomicBool::new(false)),
            resumed: Arc::new(Event::new(true)),
        }
    }

    /// Install (or clear) a predicate that drops matching datagrams.
    pub fn set_drop_rule(&self, rule: Option<DropRule>) {
        self.lock().rule = rule;
    }

    pub fn set_loss_rate(&self, rate: f64) {
        self.lock().config.loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    /// Apply the fault model to one datagram and deliver what survives.
    fn route(&self, from: PacketDest, buf: &[u8], to: &PacketDest) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let Some(queue) = inner.endpoints.get(to).cloned() else {
            inner.stats.unreachable += 1;
            return Err(TransportError::Unreachable);
        };

        let ruled_out = inner.rule.as_mut().is_some_and(|rule| rule(buf));
        let loss = inner.config.loss_rate.clamp(0.0, 1.0);
        if ruled_out || inner.rng.random_bool(loss) {
            inner.stats.dropped += 1;
            trace!("[sim] dropped {} bytes to {:?}", buf.len(), to);
            return Ok(());
        }

        let dup = inner.config.duplicate_rate.clamp(0.0, 1.0);
        let copies = if inner.rng.random_bool(dup) {
            inner.stats.duplicated += 1;
            2
        } else {
            1
        };
        let reorder = inner.config.reorder_rate.clamp(0.0, 1.0);
        let delay = inner.rng.random_bool(reorder).then_some(inner.config.reorder_delay);
        if delay.is_some() {
            inner.stats.reordered += 1;
        }
        inner.stats.delivered += 1;
        drop(inner);

        for _ in 0..copies {
            let datagram = (buf.to_vec(), from);
            match delay {
                Some(d) => {
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(d).await;
                        let _ = queue.send(datagram);
                    });
                }
                None => {
                    let _ = queue.send(datagram);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SimNetwork")
            .field("config", &inner.config)
            .field("endpoints", &inner.endpoints.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

/// Drop rule that loses the first copy of every odd-numbered data packet
/// on every channel. Retransmissions get through.
pub fn drop_first_copy_of_odd_seqs() -> DropRule {
    let mut seen: HashSet<(u32, u16)> = HashSet::new();
    Box::new(move |buf: &[u8]| {
        if buf.len() < HEADER_LEN || buf[9] & flags::CONTROL != 0 {
            return false;
        }
        let chan_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let seq = u16::from_le_bytes([buf[4], buf[5]]);
        chan_id != 0 && seq % 2 == 1 && seen.insert((chan_id, seq))
    })
}

/// Drop rule that loses every datagram with the CONTROL flag.
pub fn drop_all_control() -> DropRule {
    Box::new(|buf: &[u8]| buf.len() >= HEADER_LEN && buf[9] & flags::CONTROL != 0)
}

// ---------------------------------------------------------------------------
// SimTransport
// ---------------------------------------------------------------------------

/// One endpoint on a [`SimNetwork`]. Clones share the endpoint.
#[derive(Clone)]
pub struct SimTransport {
    net: SimNetwork,
    addr: PacketDest,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>>,
    stalled: Arc<AtomicBool>,
    resumed: Arc<Event>,
}

impl SimTransport {
    /// Address peers use to reach this endpoint.
    pub fn local_dest(&self) -> PacketDest {
        self.addr
    }

    /// Make every send fail with `Busy` until [`SimTransport::resume`].
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
        self.resumed.reset();
    }

    pub fn resume(&self) {
        self.stalled.store(false, Ordering::SeqCst);
        self.resumed.set();
    }

    pub fn network(&self) -> &SimNetwork {
        &self.net
    }
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("addr", &self.addr)
            .field("stalled", &self.stalled.load(Ordering::SeqCst))
            .finish()
    }
}

impl PacketTransport for SimTransport {
    fn source_mtu(&self) -> usize {
        self.net.mtu
    }

    fn sink_mtu(&self) -> usize {
        self.net.mtu
    }

    async fn push_packet_bytes(&self, buf: &[u8], dest: &PacketDest) -> Result<(), TransportError> {
        if buf.len() > self.net.mtu {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds mtu {}", buf.len(), self.net.mtu),
            )));
        }
        if self.stalled.load(Ordering::SeqCst) {
            return Err(TransportError::Busy);
        }
        self.net.route(self.addr, buf, dest)
    }

    async fn pull_packet_bytes(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, PacketDest), TransportError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(TransportError::TimedOut),
            Ok(None) => Err(TransportError::Io(std::io::ErrorKind::BrokenPipe.into())),
            Ok(Some((data, from))) => {
                if data.len() > buf.len() {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "datagram larger than receive buffer",
                    )));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), from))
            }
        }
    }

    async fn source_ready(&self) {}

    async fn sink_ready(&self) {
        self.resumed.wait().await;
    }

    fn describe(&self, dest: &PacketDest) -> String {
        let b = dest.as_bytes();
        format!("sim#{}", u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
