//! Per-channel state shared between the engine workers and streams.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::CloseReason;
use crate::event::Event;
use crate::packet::HEADER_LEN;
use crate::pool::PacketPool;
use crate::rx_window::RxWindow;
use crate::state::{ChannelState, HandshakeState, Role};
use crate::transport::PacketDest;
use crate::tx_window::TxWindow;

/// Mutable channel state. Guarded by [`Channel::lock`]; the guard is never
/// held across an `.await` or a transport call.
#[derive(Debug)]
pub(crate) struct ChannelInner {
    pub state: ChannelState,
    pub handshake: HandshakeState,
    pub close_reason: Option<CloseReason>,
    /// Reason carried by the peer's CLOSE, as the peer saw it.
    pub peer_reason: Option<CloseReason>,
    /// Negotiated datagram size for this channel.
    pub mtu: usize,
    pub tx: TxWindow,
    pub rx: RxWindow,
    /// Server side: SERVER_HELLO transmissions so far.
    pub handshake_attempts: u32,
    /// Server side: when SERVER_HELLO is due again.
    pub handshake_due: Option<Instant>,
    /// Packets the sender dropped on TTL since the last `push_bytes`.
    pub expired_pending: usize,
}

impl ChannelInner {
    pub fn max_fragment(&self) -> usize {
        self.mtu - HEADER_LEN
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reason.unwrap_or(CloseReason::Local)
    }
}

#[derive(Debug)]
pub(crate) struct Channel {
    pub id: u32,
    pub peer: PacketDest,
    pub role: Role,
    /// Set while unread bytes are queued.
    pub source_event: Event,
    /// Set while the send window has room.
    pub sink_event: Event,
    /// Set while the send window is empty.
    pub tx_idle: Event,
    /// Serialises whole `push_bytes` calls so fragments stay contiguous.
    pub send_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ChannelState>,
    inner: Mutex<ChannelInner>,
    pool: Arc<PacketPool>,
}

impl Channel {
    pub fn new(
        id: u32,
        peer: PacketDest,
        role: Role,
        window: u16,
        mtu: usize,
        rx_limit: usize,
        pool: Arc<PacketPool>,
    ) -> Self {
        let handshake = match role {
            Role::Client => HandshakeState::ClientHello,
            Role::Server => HandshakeState::ServerHello,
        };
        let (state_tx, _) = watch::channel(ChannelState::Opening);
        Self {
            id,
            peer,
            role,
            source_event: Event::new(false),
            sink_event: Event::new(true),
            tx_idle: Event::new(true),
            send_lock: tokio::sync::Mutex::new(()),
            state_tx,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Opening,
                handshake,
                close_reason: None,
                peer_reason: None,
                mtu,
                tx: TxWindow::new(usize::from(window)),
                rx: RxWindow::new(rx_limit),
                handshake_attempts: 0,
                handshake_due: None,
                expired_pending: 0,
            }),
            pool,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Change state under the caller's lock and wake state waiters.
    pub fn set_state(&self, inner: &mut ChannelInner, state: ChannelState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Resolve once the state satisfies `pred`.
    pub async fn wait_state(&self, pred: impl FnMut(&ChannelState) -> bool) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(pred).await;
    }

    /// Resolve once the channel is closing or closed.
    pub async fn closing(&self) {
        self.wait_state(|s| s.is_closing()).await;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut held = inner.tx.drain();
        held.extend(inner.rx.drain());
        for p in held {
            self.pool.return_packet(p);
        }
    }
}
