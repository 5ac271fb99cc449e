//! The reliable packet engine.
//!
//! One [`PacketEngine`] multiplexes any number of channels over a single
//! [`PacketTransport`]. Two background tasks do all the I/O:
//!
//! ```text
//!   push_bytes ──▶ TxWindow ──▶ send worker ─────▶ transport ──▶ peer
//!                     ▲                                │
//!                     └──── ACK ◀── receive worker ◀───┘
//!   pull_bytes ◀── RxWindow ◀──────────┘
//! ```
//!
//! - The **receive worker** pulls datagrams, verifies them, routes control
//!   messages (handshake, ACK, CLOSE) and feeds data packets into the
//!   channel's receive window, acknowledging each one.
//! - The **send worker** walks every channel, drops expired packets and
//!   transmits whatever the send window says is due: fast retransmits
//!   first, then timer retransmits, then fresh packets.
//!
//! Per-channel state sits behind a plain mutex that is never held across
//! an `.await`. Application tasks block on the channel's source and sink
//! events, never on the transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{debug, info, trace, warn};
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::config::{EngineConfig, ExpiredSendPolicy, MIN_MTU};
use crate::control::ControlMessage;
use crate::error::{CloseReason, EngineError, TransportError};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::packet::{flags, Packet};
use crate::pool::PacketPool;
use crate::rx_window::RxVerdict;
use crate::state::{ChannelState, HandshakeState, PacketState, Role};
use crate::stream::PacketStream;
use crate::transport::{PacketDest, PacketTransport};
use crate::tx_window::TxAction;

/// How many times a single datagram is retried on `Busy` before the caller
/// gives up for this round.
const BUSY_RETRIES: usize = 3;

/// Upper bound on one wait for transport readiness.
const READY_WAIT: Duration = Duration::from_millis(100);

/// Send worker wake-up interval when nothing is scheduled.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Returns the current time on the Tokio clock.
#[inline]
fn tok_now() -> Instant {
    Instant::now()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn clamp_u16(v: usize) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

// ---------------------------------------------------------------------------
// PacketEngine
// ---------------------------------------------------------------------------

/// Reliable, ordered, TTL-aware channels over an unreliable transport.
pub struct PacketEngine<T: PacketTransport> {
    inner: Arc<EngineInner<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: PacketTransport> PacketEngine<T> {
    /// Start an engine with its own packet pool.
    ///
    /// The working MTU is the smallest of `config.mtu` and the transport's
    /// source and sink MTUs. Must be called from inside a Tokio runtime.
    pub fn start(config: EngineConfig, transport: T) -> Result<Self, EngineError> {
        config.validate()?;
        let mtu = config
            .mtu
            .min(transport.source_mtu())
            .min(transport.sink_mtu());
        if mtu < MIN_MTU {
            return Err(EngineError::InvalidConfig(
                "transport mtu smaller than header plus control message",
            ));
        }
        Self::start_with_pool(config, transport, Arc::new(PacketPool::new(mtu)))
    }

    /// Start an engine that draws packets from an existing pool.
    ///
    /// The pool's MTU must fit both directions of the transport.
    pub fn start_with_pool(
        config: EngineConfig,
        transport: T,
        pool: Arc<PacketPool>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if pool.mtu() < MIN_MTU
            || pool.mtu() > transport.source_mtu()
            || pool.mtu() > transport.sink_mtu()
        {
            return Err(EngineError::InvalidConfig("pool mtu does not fit the transport"));
        }
        let mtu = pool.mtu().min(config.mtu);
        let (shutdown, _) = watch::channel(false);
        info!(
            "[engine] starting: mtu={} window={} max_attempts={}",
            mtu, config.window_size, config.max_attempts
        );

        let inner = Arc::new(EngineInner {
            config,
            transport,
            pool,
            mtu,
            channels: RwLock::new(HashMap::new()),
            accept_queue: Mutex::new(VecDeque::new()),
            accept_ready: Notify::new(),
            send_wake: Notify::new(),
            shutdown,
            stopped: AtomicBool::new(false),
            metrics: EngineMetrics::default(),
        });

        let rx_worker = tokio::spawn(Arc::clone(&inner).receive_loop());
        let tx_worker = tokio::spawn(Arc::clone(&inner).send_loop());
        Ok(Self {
            inner,
            workers: Mutex::new(vec![rx_worker, tx_worker]),
        })
    }

    /// Working MTU after clamping to the transport.
    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.inner.pool
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Channels currently known to the engine, in any state but closed.
    pub fn channel_count(&self) -> usize {
        self.inner.table().len()
    }

    /// Open a channel to `peer` and return its id once the handshake
    /// completes.
    ///
    /// Fails with [`EngineError::HandshakeFailed`] when the peer never
    /// answers within the retry budget.
    pub async fn create_channel(&self, peer: PacketDest) -> Result<u32, EngineError> {
        self.inner.open_channel(peer).await.map(|ch| ch.id)
    }

    /// Like [`PacketEngine::create_channel`] but returns a stream handle.
    pub async fn connect(&self, peer: PacketDest) -> Result<PacketStream<T>, EngineError> {
        let ch = self.inner.open_channel(peer).await?;
        Ok(PacketStream::new(Arc::clone(&self.inner), ch))
    }

    /// Wait for a peer to open a channel to us.
    ///
    /// With `from` set, only channels from that peer are taken. `None` for
    /// `timeout` waits forever.
    pub async fn accept_channel(
        &self,
        from: Option<PacketDest>,
        timeout: Option<Duration>,
    ) -> Result<u32, EngineError> {
        self.inner.accept_on(from, timeout).await.map(|ch| ch.id)
    }

    /// Like [`PacketEngine::accept_channel`] but returns a stream handle.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<PacketStream<T>, EngineError> {
        let ch = self.inner.accept_on(None, timeout).await?;
        Ok(PacketStream::new(Arc::clone(&self.inner), ch))
    }

    /// Stream handle for an open channel.
    pub fn stream(&self, chan_id: u32) -> Result<PacketStream<T>, EngineError> {
        let ch = self.inner.lookup(chan_id)?;
        Ok(PacketStream::new(Arc::clone(&self.inner), ch))
    }

    /// Queue `buf` on `chan_id`, fragmenting as needed.
    ///
    /// `ttl_ms == 0` never expires. Waits at most `config.send_timeout` for
    /// window space and returns the bytes accepted.
    pub async fn push_bytes(&self, chan_id: u32, buf: &[u8], ttl_ms: u32) -> Result<usize, EngineError> {
        let ch = self.inner.lookup(chan_id)?;
        let timeout = self.inner.config.send_timeout;
        self.inner.push_on(&ch, buf, ttl_ms, timeout).await
    }

    /// Read in-order bytes from `chan_id`. `None` waits forever.
    pub async fn pull_bytes(
        &self,
        chan_id: u32,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EngineError> {
        let ch = self.inner.lookup(chan_id)?;
        self.inner.pull_on(&ch, buf, timeout).await
    }

    /// Close `chan_id`, lingering up to `config.close_linger` for unsent
    /// data, and tell the peer.
    pub async fn close_channel(&self, chan_id: u32) -> Result<(), EngineError> {
        let ch = self.inner.lookup(chan_id)?;
        self.inner.close_channel(&ch, CloseReason::Local).await;
        Ok(())
    }

    /// Close every channel, stop both workers and wait for them to exit.
    ///
    /// Engine operations fail with [`EngineError::EngineStopped`] afterwards.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[engine] stopping");
        self.inner.accept_ready.notify_waiters();

        let channels = self.inner.snapshot_channels();
        for ch in channels {
            self.inner.close_channel(&ch, CloseReason::EngineStopped).await;
        }
        self.inner.lock_accept_queue().clear();
        self.inner.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for h in handles {
            if let Err(e) = h.await {
                warn!("[engine] worker ended abnormally: {e}");
            }
        }
        info!("[engine] stopped");
    }
}

impl<T: PacketTransport> Drop for PacketEngine<T> {
    fn drop(&mut self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[engine] dropped without stop(); closing channels");
        self.inner.accept_ready.notify_waiters();
        for ch in self.inner.snapshot_channels() {
            self.inner.finish_close(&ch, CloseReason::EngineStopped);
        }
        self.inner.lock_accept_queue().clear();
        self.inner.shutdown.send_replace(true);
    }
}

impl<T: PacketTransport> std::fmt::Debug for PacketEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEngine")
            .field("mtu", &self.inner.mtu)
            .field("channels", &self.inner.table().len())
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EngineInner
// ---------------------------------------------------------------------------

/// State shared by the engine handle, its workers and every stream.
pub(crate) struct EngineInner<T: PacketTransport> {
    config: EngineConfig,
    transport: T,
    pool: Arc<PacketPool>,
    mtu: usize,
    channels: RwLock<HashMap<u32, Arc<Channel>>>,
    accept_queue: Mutex<VecDeque<Arc<Channel>>>,
    accept_ready: Notify,
    send_wake: Notify,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    metrics: EngineMetrics,
}

/// Work the send worker found for one channel.
enum Work {
    Idle(Option<Instant>),
    Progress,
    Send { seq: u16, attempt: u32, fast: bool },
    ServerHello { window: u16, mtu: u16 },
    Fail(CloseReason),
}

/// What the receive path decided about one data packet.
#[derive(Default)]
struct DataOutcome {
    reply: Option<(ControlMessage, u8)>,
    recycle: Vec<Packet>,
    opened: bool,
}

/// Why one fragment could not be queued.
enum Blocked {
    Full(Packet),
    Closed(CloseReason, Packet),
}

impl<T: PacketTransport> EngineInner<T> {
    // -- table helpers ------------------------------------------------------

    fn table(&self) -> RwLockReadGuard<'_, HashMap<u32, Arc<Channel>>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, HashMap<u32, Arc<Channel>>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_accept_queue(&self) -> MutexGuard<'_, VecDeque<Arc<Channel>>> {
        self.accept_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, chan_id: u32) -> Option<Arc<Channel>> {
        self.table().get(&chan_id).cloned()
    }

    fn snapshot_channels(&self) -> Vec<Arc<Channel>> {
        self.table().values().cloned().collect()
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::EngineStopped);
        }
        Ok(())
    }

    fn lookup(&self, chan_id: u32) -> Result<Arc<Channel>, EngineError> {
        self.ensure_running()?;
        self.find(chan_id).ok_or(EngineError::UnknownChannel(chan_id))
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn describe(&self, dest: &PacketDest) -> String {
        self.transport.describe(dest)
    }

    fn recycle(&self, packets: Vec<Packet>) {
        for p in packets {
            self.pool.return_packet(p);
        }
    }

    // -- outbound datagrams -------------------------------------------------

    /// Hand one datagram to the transport, waiting briefly for readiness
    /// while it reports `Busy`.
    async fn push_datagram(&self, wire: &[u8], peer: &PacketDest) -> Result<(), TransportError> {
        for _ in 0..BUSY_RETRIES {
            match self.transport.push_packet_bytes(wire, peer).await {
                Err(TransportError::Busy) => {
                    let _ = tokio::time::timeout(READY_WAIT, self.transport.sink_ready()).await;
                }
                other => return other,
            }
        }
        Err(TransportError::Busy)
    }

    async fn send_control(&self, peer: &PacketDest, msg: ControlMessage, extra_flags: u8) {
        let mut pkt = self.pool.get_packet();
        pkt.chan_id = 0;
        pkt.seq_num = msg.kind();
        pkt.gap = 0;
        pkt.flags = flags::CONTROL | extra_flags;
        pkt.expire_at = None;
        pkt.set_payload(&msg.encode());

        let result = self.push_datagram(pkt.marshal(tok_now()), peer).await;
        match result {
            Ok(()) => {
                self.metrics.add_sent(1);
                trace!("[ctrl] -> {} {:?}", self.describe(peer), msg);
            }
            Err(e) => {
                self.metrics.add_transport_errors(1);
                debug!("[ctrl] could not send {:?} to {}: {e}", msg, self.describe(peer));
            }
        }
        self.pool.return_packet(pkt);
    }

    // -- open / accept ------------------------------------------------------

    async fn open_channel(&self, peer: PacketDest) -> Result<Arc<Channel>, EngineError> {
        self.ensure_running()?;
        let ch = {
            let mut table = self.table_mut();
            let mut rng = rand::rng();
            let id = loop {
                let id: u32 = rng.random();
                if id != 0 && !table.contains_key(&id) {
                    break id;
                }
            };
            let ch = Arc::new(Channel::new(
                id,
                peer,
                Role::Client,
                self.config.window_size,
                self.mtu,
                self.config.rx_queue_limit,
                Arc::clone(&self.pool),
            ));
            table.insert(id, Arc::clone(&ch));
            ch
        };
        info!("[handshake] chan {:#010x}: opening to {}", ch.id, self.describe(&peer));

        let hello = ControlMessage::ClientHello {
            chan_id: ch.id,
            window: self.config.window_size,
            mtu: clamp_u16(self.mtu),
        };
        for attempt in 1..=self.config.max_attempts {
            self.send_control(&peer, hello, 0).await;
            let wait = self.config.retry_schedule.wait_after(attempt);
            let answered = tokio::time::timeout(wait, ch.wait_state(|s| *s != ChannelState::Opening))
                .await
                .is_ok();
            if answered {
                break;
            }
            debug!("[handshake] chan {:#010x}: attempt {attempt} unanswered", ch.id);
        }

        match ch.state() {
            ChannelState::Open => {
                info!("[handshake] chan {:#010x}: open (mtu {})", ch.id, ch.lock().mtu);
                Ok(ch)
            }
            ChannelState::Opening => {
                warn!(
                    "[handshake] chan {:#010x}: no answer from {}",
                    ch.id,
                    self.describe(&peer)
                );
                if self.finish_close(&ch, CloseReason::NoResponseToAllRetries) {
                    self.send_control(
                        &peer,
                        ControlMessage::Close { chan_id: ch.id, reason: CloseReason::Local },
                        0,
                    )
                    .await;
                }
                Err(EngineError::HandshakeFailed)
            }
            ChannelState::Closing | ChannelState::Closed => {
                let reason = ch.lock().close_reason();
                if reason == CloseReason::EngineStopped {
                    Err(EngineError::EngineStopped)
                } else {
                    Err(EngineError::ChannelClosed(reason))
                }
            }
        }
    }

    async fn accept_on(
        &self,
        from: Option<PacketDest>,
        timeout: Option<Duration>,
    ) -> Result<Arc<Channel>, EngineError> {
        let deadline = timeout.map(|t| tok_now() + t);
        loop {
            self.ensure_running()?;
            let notified = self.accept_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ch) = self.take_accepted(from) {
                info!(
                    "[engine] chan {:#010x}: accepted from {}",
                    ch.id,
                    self.describe(&ch.peer)
                );
                return Ok(ch);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until_opt(deadline) => return Err(EngineError::Timeout),
            }
        }
    }

    fn take_accepted(&self, from: Option<PacketDest>) -> Option<Arc<Channel>> {
        let mut queue = self.lock_accept_queue();
        let idx = queue
            .iter()
            .position(|ch| from.map_or(true, |peer| ch.peer == peer))?;
        queue.remove(idx)
    }

    /// Server side: the handshake finished (explicitly or by the first data
    /// packet). Caller holds the channel lock.
    fn mark_server_open(&self, ch: &Channel, inner: &mut crate::channel::ChannelInner) -> bool {
        if ch.role != Role::Server || inner.state != ChannelState::Opening {
            return false;
        }
        inner.handshake = HandshakeState::Open;
        inner.handshake_due = None;
        ch.set_state(inner, ChannelState::Open);
        true
    }

    fn publish_accepted(&self, ch: &Arc<Channel>) {
        info!("[handshake] chan {:#010x}: open (server side)", ch.id);
        self.lock_accept_queue().push_back(Arc::clone(ch));
        self.accept_ready.notify_waiters();
    }

    // -- push / pull --------------------------------------------------------

    pub(crate) async fn push_on(
        &self,
        ch: &Arc<Channel>,
        buf: &[u8],
        ttl_ms: u32,
        send_timeout: Option<Duration>,
    ) -> Result<usize, EngineError> {
        let deadline = send_timeout.map(|t| tok_now() + t);
        let _serial = match deadline {
            Some(at) => tokio::time::timeout_at(at, ch.send_lock.lock())
                .await
                .map_err(|_| EngineError::WouldBlock)?,
            None => ch.send_lock.lock().await,
        };

        let frag = {
            let mut inner = ch.lock();
            if inner.state.is_closing() {
                return Err(EngineError::ChannelClosed(inner.close_reason()));
            }
            if inner.state == ChannelState::Opening {
                return Err(EngineError::WouldBlock);
            }
            if inner.expired_pending > 0 {
                debug!(
                    "[tx] chan {:#010x}: {} packet(s) expired unsent",
                    ch.id, inner.expired_pending
                );
                inner.expired_pending = 0;
                return Err(EngineError::WouldBlock);
            }
            inner.max_fragment()
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        let mut staged: Option<Packet> = None;
        while sent < buf.len() {
            let pkt = match staged.take() {
                Some(p) => p,
                None => {
                    let mut p = self.pool.get_packet();
                    let end = (sent + frag).min(buf.len());
                    p.set_payload(&buf[sent..end]);
                    p.chan_id = ch.id;
                    p.flags = flags::ACK_REQUIRED;
                    p.set_ttl(ttl_ms, tok_now());
                    p
                }
            };
            let len = pkt.payload_len();

            let queued = {
                let mut inner = ch.lock();
                if inner.state.is_closing() {
                    Err(Blocked::Closed(inner.close_reason(), pkt))
                } else {
                    match inner.tx.try_push(pkt) {
                        Ok(seq) => {
                            ch.tx_idle.reset();
                            if !inner.tx.has_space() {
                                ch.sink_event.reset();
                            }
                            Ok(seq)
                        }
                        Err(pkt) => {
                            ch.sink_event.reset();
                            Err(Blocked::Full(pkt))
                        }
                    }
                }
            };

            match queued {
                Ok(seq) => {
                    trace!("[tx] chan {:#010x}: queued seq {seq} ({len} bytes)", ch.id);
                    sent += len;
                    self.send_wake.notify_one();
                }
                Err(Blocked::Closed(reason, pkt)) => {
                    self.pool.return_packet(pkt);
                    return Err(EngineError::ChannelClosed(reason));
                }
                Err(Blocked::Full(pkt)) => {
                    staged = Some(pkt);
                    let timed_out = tokio::select! {
                        _ = ch.sink_event.wait() => false,
                        _ = ch.closing() => false,
                        _ = sleep_until_opt(deadline) => true,
                    };
                    if timed_out {
                        if let Some(p) = staged.take() {
                            self.pool.return_packet(p);
                        }
                        return if sent == 0 { Err(EngineError::WouldBlock) } else { Ok(sent) };
                    }
                }
            }
        }
        Ok(sent)
    }

    pub(crate) async fn pull_on(
        &self,
        ch: &Arc<Channel>,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EngineError> {
        let deadline = timeout.map(|t| tok_now() + t);
        loop {
            {
                let mut inner = ch.lock();
                let reason = inner.close_reason();
                let peer_closed = inner.state == ChannelState::Closed && reason == CloseReason::Peer;
                if inner.state.is_closing() && !peer_closed {
                    return Err(EngineError::ChannelClosed(reason));
                }
                if buf.is_empty() {
                    return Ok(0);
                }
                let got = inner.rx.read(buf, tok_now());
                if !inner.rx.has_ready() {
                    ch.source_event.reset();
                }
                drop(inner);
                if got.expired > 0 {
                    self.metrics.add_rx_ttl_drops(got.expired as u64);
                }
                self.recycle(got.recycle);
                if got.bytes > 0 {
                    return Ok(got.bytes);
                }
                if peer_closed {
                    return Err(EngineError::ChannelClosed(CloseReason::Peer));
                }
            }
            tokio::select! {
                _ = ch.source_event.wait() => {}
                _ = ch.closing() => {}
                _ = sleep_until_opt(deadline) => return Err(EngineError::Timeout),
            }
        }
    }

    // -- close --------------------------------------------------------------

    /// Close `ch` for `reason`, lingering for unsent data on a local close,
    /// and send CLOSE to the peer unless the peer asked for it.
    pub(crate) async fn close_channel(&self, ch: &Arc<Channel>, reason: CloseReason) {
        let linger = self.config.close_linger;
        let drain = {
            let mut inner = ch.lock();
            match inner.state {
                ChannelState::Closed => return,
                ChannelState::Closing if reason == CloseReason::Local => return,
                ChannelState::Open
                    if reason == CloseReason::Local && !inner.tx.is_empty() && !linger.is_zero() =>
                {
                    ch.set_state(&mut inner, ChannelState::Closing);
                    true
                }
                _ => false,
            }
        };
        if drain {
            debug!("[engine] chan {:#010x}: draining before close", ch.id);
            if tokio::time::timeout(linger, ch.tx_idle.wait()).await.is_err() {
                debug!("[engine] chan {:#010x}: linger expired, discarding unsent data", ch.id);
            }
        }
        if self.finish_close(ch, reason) && reason != CloseReason::Peer {
            self.send_control(&ch.peer, ControlMessage::Close { chan_id: ch.id, reason }, 0)
                .await;
        }
    }

    /// Move `ch` to `Closed` now and release its packets. Returns `false`
    /// if it was already closed.
    fn finish_close(&self, ch: &Arc<Channel>, reason: CloseReason) -> bool {
        let recycled = {
            let mut inner = ch.lock();
            if inner.state == ChannelState::Closed {
                return false;
            }
            inner.close_reason = Some(reason);
            inner.expired_pending = 0;
            ch.set_state(&mut inner, ChannelState::Closed);
            let mut held = inner.tx.drain();
            if !held.is_empty() {
                debug!(
                    "[tx] chan {:#010x}: {} packet(s) {}",
                    ch.id,
                    held.len(),
                    PacketState::Error
                );
            }
            if reason == CloseReason::Peer {
                held.extend(inner.rx.discard_pending());
            } else {
                held.extend(inner.rx.drain());
                ch.source_event.reset();
            }
            held
        };
        ch.tx_idle.set();

        {
            let mut table = self.table_mut();
            if table.get(&ch.id).is_some_and(|c| Arc::ptr_eq(c, ch)) {
                table.remove(&ch.id);
            }
        }
        if reason != CloseReason::Peer {
            self.lock_accept_queue().retain(|c| !Arc::ptr_eq(c, ch));
        }
        self.recycle(recycled);
        info!("[engine] chan {:#010x}: closed ({reason})", ch.id);
        true
    }

    // -- receive worker -----------------------------------------------------

    async fn receive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        debug!("[rx] worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut pkt = self.pool.get_packet();
            let res = tokio::select! {
                _ = shutdown.changed() => None,
                r = pkt.unmarshal_from(&self.transport, self.config.pull_timeout) => Some(r),
            };
            match res {
                None => {
                    self.pool.return_packet(pkt);
                    break;
                }
                Some(Ok(())) => {
                    self.metrics.add_received(1);
                    self.dispatch(pkt).await;
                }
                Some(Err(e)) => {
                    self.pool.return_packet(pkt);
                    match e {
                        EngineError::BadCrc => {
                            self.metrics.add_bad_crc(1);
                            debug!("[rx] dropped datagram: bad crc");
                        }
                        EngineError::BadFormat => {
                            self.metrics.add_bad_format(1);
                            debug!("[rx] dropped datagram: bad format");
                        }
                        EngineError::Transport(TransportError::TimedOut) => {}
                        other => {
                            self.metrics.add_transport_errors(1);
                            debug!("[rx] transport error: {other}");
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::timeout(READY_WAIT, self.transport.source_ready()) => {}
                            }
                        }
                    }
                }
            }
        }
        debug!("[rx] worker exiting");
    }

    async fn dispatch(&self, pkt: Packet) {
        let Some(sender) = pkt.sender else {
            self.pool.return_packet(pkt);
            return;
        };
        if pkt.chan_id != 0 {
            self.on_data(pkt, sender).await;
            return;
        }

        let parsed = if pkt.flags & flags::CONTROL != 0 {
            ControlMessage::decode(pkt.seq_num, pkt.payload())
        } else {
            Err(crate::error::PacketError::BadFormat(pkt.payload_len()))
        };
        let header_flags = pkt.flags;
        self.pool.return_packet(pkt);

        match parsed {
            Ok(msg) => {
                trace!("[ctrl] <- {} {:?}", self.describe(&sender), msg);
                self.on_control(msg, sender, header_flags).await;
            }
            Err(e) => {
                self.metrics.add_bad_format(1);
                debug!("[ctrl] bad control message from {}: {e}", self.describe(&sender));
            }
        }
    }

    async fn on_data(&self, pkt: Packet, sender: PacketDest) {
        let chan_id = pkt.chan_id;
        let ch = self.find(chan_id);
        let Some(ch) = ch else {
            trace!("[rx] data for unknown chan {chan_id:#010x}; answering CLOSE");
            self.pool.return_packet(pkt);
            self.send_control(&sender, ControlMessage::Close { chan_id, reason: CloseReason::Local }, 0)
                .await;
            return;
        };
        if ch.peer != sender {
            warn!(
                "[rx] chan {:#010x}: data from unexpected peer {}",
                chan_id,
                self.describe(&sender)
            );
            self.pool.return_packet(pkt);
            return;
        }

        let out = self.absorb_data(&ch, pkt);
        self.recycle(out.recycle);
        if out.opened {
            self.publish_accepted(&ch);
        }
        if let Some((msg, extra)) = out.reply {
            self.send_control(&sender, msg, extra).await;
        }
    }

    fn absorb_data(&self, ch: &Channel, pkt: Packet) -> DataOutcome {
        let mut out = DataOutcome::default();
        let mut inner = ch.lock();
        match inner.state {
            ChannelState::Opening if ch.role == Role::Server => {
                out.opened = self.mark_server_open(ch, &mut inner);
            }
            ChannelState::Opening | ChannelState::Closed => {
                out.recycle.push(pkt);
                return out;
            }
            ChannelState::Open | ChannelState::Closing => {}
        }

        let seq = pkt.seq_num;
        let r = inner.rx.on_packet(pkt, tok_now(), self.config.fast_retransmit_threshold);
        if r.expired > 0 {
            self.metrics.add_rx_ttl_drops(r.expired as u64);
        }
        out.recycle = r.recycle;
        let extra = match r.verdict {
            RxVerdict::Overflow => {
                self.metrics.add_rx_queue_full(1);
                trace!("[rx] chan {:#010x}: queue full, refused seq {seq}", ch.id);
                Some(flags::RECEIVER_FULL)
            }
            RxVerdict::Duplicate => {
                self.metrics.add_duplicates(1);
                Some(0)
            }
            RxVerdict::Buffered { gap_ack: true } => {
                debug!(
                    "[rx] chan {:#010x}: hole at {} (got {seq}); requesting fast retransmit",
                    ch.id,
                    inner.rx.expected()
                );
                Some(flags::FAST_RETRANSMIT)
            }
            RxVerdict::Accepted | RxVerdict::Buffered { gap_ack: false } => Some(0),
        };
        out.reply = extra.map(|extra| {
            let ack = ControlMessage::Ack {
                chan_id: ch.id,
                seq,
                cumulative: inner.rx.expected(),
            };
            (ack, extra)
        });
        if inner.rx.has_ready() {
            ch.source_event.set();
        }
        out
    }

    async fn on_control(&self, msg: ControlMessage, sender: PacketDest, header_flags: u8) {
        match msg {
            ControlMessage::ClientHello { chan_id, window, mtu } => {
                self.on_client_hello(chan_id, window, mtu, sender).await;
            }
            ControlMessage::ServerHello { chan_id, window, mtu } => {
                self.on_server_hello(chan_id, window, mtu, sender).await;
            }
            ControlMessage::ClientAck { chan_id } => {
                let Some(ch) = self.find(chan_id).filter(|c| c.peer == sender) else {
                    return;
                };
                let opened = {
                    let mut inner = ch.lock();
                    self.mark_server_open(&ch, &mut inner)
                };
                if opened {
                    self.publish_accepted(&ch);
                }
            }
            ControlMessage::Ack { chan_id, seq, cumulative } => {
                if let Some(ch) = self.find(chan_id).filter(|c| c.peer == sender) {
                    self.on_ack(&ch, seq, cumulative, header_flags);
                }
            }
            ControlMessage::Close { chan_id, reason } => {
                if let Some(ch) = self.find(chan_id).filter(|c| c.peer == sender) {
                    debug!("[engine] chan {chan_id:#010x}: peer closed ({reason})");
                    {
                        let mut inner = ch.lock();
                        if inner.state != ChannelState::Closed {
                            inner.peer_reason = Some(reason);
                        }
                    }
                    self.finish_close(&ch, CloseReason::Peer);
                }
            }
        }
    }

    async fn on_client_hello(&self, chan_id: u32, window: u16, mtu: u16, sender: PacketDest) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let ch = match self.find(chan_id) {
            Some(ch) if ch.peer == sender && ch.role == Role::Server => ch,
            Some(_) => {
                debug!("[handshake] chan {chan_id:#010x}: id already in use; ignoring hello");
                return;
            }
            None => {
                let mtu = usize::from(mtu).min(self.mtu);
                if mtu < MIN_MTU {
                    debug!("[handshake] chan {chan_id:#010x}: peer mtu {mtu} too small");
                    return;
                }
                let window = window.clamp(1, self.config.window_size);
                let ch = Arc::new(Channel::new(
                    chan_id,
                    sender,
                    Role::Server,
                    window,
                    mtu,
                    self.config.rx_queue_limit,
                    Arc::clone(&self.pool),
                ));
                {
                    let mut inner = ch.lock();
                    inner.handshake_attempts = 1;
                    inner.handshake_due = Some(tok_now() + self.config.retry_schedule.wait_after(1));
                }
                {
                    let mut table = self.table_mut();
                    if table.contains_key(&chan_id) {
                        return;
                    }
                    table.insert(chan_id, Arc::clone(&ch));
                }
                info!(
                    "[handshake] chan {chan_id:#010x}: offered by {} (window {window}, mtu {mtu})",
                    self.describe(&sender)
                );
                self.send_wake.notify_one();
                ch
            }
        };

        let (window, mtu) = {
            let inner = ch.lock();
            (clamp_u16(inner.tx.capacity()), clamp_u16(inner.mtu))
        };
        self.send_control(&sender, ControlMessage::ServerHello { chan_id, window, mtu }, 0)
            .await;
    }

    async fn on_server_hello(&self, chan_id: u32, window: u16, mtu: u16, sender: PacketDest) {
        let Some(ch) = self
            .find(chan_id)
            .filter(|c| c.peer == sender && c.role == Role::Client)
        else {
            return;
        };
        let open = {
            let mut inner = ch.lock();
            if inner.state == ChannelState::Opening {
                let mtu = usize::from(mtu).min(inner.mtu);
                if mtu < MIN_MTU {
                    debug!("[handshake] chan {chan_id:#010x}: server mtu {mtu} too small");
                    return;
                }
                inner.mtu = mtu;
                let window = usize::from(window.clamp(1, self.config.window_size));
                inner.tx.set_capacity(window);
                inner.handshake = HandshakeState::ClientAck;
                ch.set_state(&mut inner, ChannelState::Open);
            }
            inner.state == ChannelState::Open
        };
        if open {
            self.send_control(&sender, ControlMessage::ClientAck { chan_id }, 0).await;
            ch.lock().handshake = HandshakeState::Open;
        }
    }

    fn on_ack(&self, ch: &Channel, seq: u16, cumulative: u16, header_flags: u8) {
        let full = header_flags & flags::RECEIVER_FULL != 0;
        let fast = header_flags & flags::FAST_RETRANSMIT != 0;
        let (acked, wake) = {
            let mut inner = ch.lock();
            let acked = if full {
                trace!("[tx] chan {:#010x}: peer queue full, seq {seq} deferred", ch.id);
                inner.tx.on_receiver_full(cumulative, seq, tok_now())
            } else {
                inner.tx.on_ack(cumulative, seq)
            };
            let wake = fast && inner.tx.mark_fast_retransmit(cumulative);
            if inner.tx.has_space() {
                ch.sink_event.set();
            }
            if inner.tx.is_empty() {
                ch.tx_idle.set();
            }
            (acked, wake)
        };
        if !acked.is_empty() {
            trace!(
                "[tx] chan {:#010x}: {} packet(s) {} (cumulative {cumulative})",
                ch.id,
                acked.len(),
                PacketState::ReceivedSuccessResponse
            );
        }
        self.recycle(acked);
        if wake {
            self.send_wake.notify_one();
        }
    }

    // -- send worker --------------------------------------------------------

    async fn send_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut scratch = Vec::with_capacity(self.mtu);
        debug!("[tx] worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = tok_now();
            let mut progressed = false;
            let mut next_wake = None;
            for ch in self.snapshot_channels() {
                match self.service_channel(&ch, now, &mut scratch).await {
                    Some(deadline) => next_wake = earliest(next_wake, deadline),
                    None => progressed = true,
                }
            }
            if progressed {
                tokio::task::yield_now().await;
                continue;
            }
            let wake_at = next_wake.unwrap_or(now + IDLE_TICK);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.send_wake.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
        debug!("[tx] worker exiting");
    }

    /// Do one unit of work for `ch`. Returns `None` after doing something,
    /// or `Some(next deadline)` when the channel is idle.
    async fn service_channel(
        &self,
        ch: &Arc<Channel>,
        now: Instant,
        scratch: &mut Vec<u8>,
    ) -> Option<Option<Instant>> {
        match self.next_work(ch, now, scratch) {
            Work::Idle(deadline) => Some(deadline),
            Work::Progress => None,
            Work::ServerHello { window, mtu } => {
                let msg = ControlMessage::ServerHello { chan_id: ch.id, window, mtu };
                self.send_control(&ch.peer, msg, 0).await;
                None
            }
            Work::Fail(reason) => {
                self.close_channel(ch, reason).await;
                None
            }
            Work::Send { seq, attempt, fast } => {
                match self.push_datagram(scratch.as_slice(), &ch.peer).await {
                    Ok(()) => {
                        ch.lock().tx.mark_sent(seq, tok_now());
                        self.metrics.add_sent(1);
                        if attempt > 1 {
                            self.metrics.add_retransmissions(1);
                            debug!("[tx] chan {:#010x}: resent seq {seq} (attempt {attempt})", ch.id);
                        }
                        if fast {
                            self.metrics.add_fast_retransmissions(1);
                        }
                    }
                    Err(TransportError::Busy) => {
                        trace!("[tx] chan {:#010x}: transport busy, seq {seq} deferred", ch.id);
                    }
                    Err(e) => {
                        // Counts as an attempt; the retry timer paces the resend.
                        ch.lock().tx.mark_sent(seq, tok_now());
                        self.metrics.add_transport_errors(1);
                        debug!("[tx] chan {:#010x}: seq {seq} not sent: {e}", ch.id);
                    }
                }
                None
            }
        }
    }

    fn next_work(&self, ch: &Channel, now: Instant, scratch: &mut Vec<u8>) -> Work {
        let mut inner = ch.lock();
        match inner.state {
            ChannelState::Closed => return Work::Idle(None),
            ChannelState::Opening if ch.role == Role::Client => return Work::Idle(None),
            ChannelState::Opening => {
                let Some(due) = inner.handshake_due else {
                    return Work::Idle(None);
                };
                if due > now {
                    return Work::Idle(Some(due));
                }
                if inner.handshake_attempts >= self.config.max_attempts {
                    warn!("[handshake] chan {:#010x}: client never acknowledged", ch.id);
                    return Work::Fail(CloseReason::NoResponseToAllRetries);
                }
                inner.handshake_attempts += 1;
                inner.handshake_due =
                    Some(now + self.config.retry_schedule.wait_after(inner.handshake_attempts));
                return Work::ServerHello {
                    window: clamp_u16(inner.tx.capacity()),
                    mtu: clamp_u16(inner.mtu),
                };
            }
            ChannelState::Open | ChannelState::Closing => {}
        }

        let poll = inner
            .tx
            .poll(now, &self.config.retry_schedule, self.config.max_attempts);
        let dropped = poll.expired.len();
        if dropped > 0 {
            debug!("[tx] chan {:#010x}: {dropped} packet(s) expired before delivery", ch.id);
            self.metrics.add_tx_ttl_drops(dropped as u64);
            if self.config.expired_send_policy == ExpiredSendPolicy::SurfaceWouldBlock {
                inner.expired_pending += dropped;
            }
            if inner.tx.has_space() {
                ch.sink_event.set();
            }
            if inner.tx.is_empty() {
                ch.tx_idle.set();
            }
            self.recycle(poll.expired);
        }

        match poll.action {
            TxAction::Send { seq, fast } => match inner.tx.prepare(seq, now, scratch) {
                Some(attempt) => Work::Send { seq, attempt, fast },
                None => Work::Idle(None),
            },
            TxAction::Exhausted { seq } => {
                self.metrics.add_exhausted(1);
                warn!(
                    "[tx] chan {:#010x}: seq {seq} {} ({} attempts)",
                    ch.id,
                    PacketState::NoResponseToAllRetries,
                    self.config.max_attempts
                );
                Work::Fail(CloseReason::NoResponseToAllRetries)
            }
            TxAction::Idle { .. } if dropped > 0 => Work::Progress,
            TxAction::Idle { next_deadline } => Work::Idle(next_deadline),
        }
    }
}
