//! Byte-stream handle for one channel.
//!
//! A [`PacketStream`] is a cheap, cloneable view of a channel owned by a
//! [`crate::engine::PacketEngine`]. Clones share the channel; closing any of
//! them closes it for all. Dropping a stream does not close the channel.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::engine::EngineInner;
use crate::error::{CloseReason, EngineError};
use crate::event::Event;
use crate::state::ChannelState;
use crate::transport::{PacketDest, PacketTransport};

/// Application data attached to a stream.
pub type StreamContext = Arc<dyn Any + Send + Sync>;

pub struct PacketStream<T: PacketTransport> {
    engine: Arc<EngineInner<T>>,
    channel: Arc<Channel>,
    send_timeout: Option<Duration>,
    context: Option<StreamContext>,
}

impl<T: PacketTransport> PacketStream<T> {
    pub(crate) fn new(engine: Arc<EngineInner<T>>, channel: Arc<Channel>) -> Self {
        let send_timeout = engine.config().send_timeout;
        Self {
            engine,
            channel,
            send_timeout,
            context: None,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel.id
    }

    /// Transport identity of the other end.
    pub fn peer(&self) -> PacketDest {
        self.channel.peer
    }

    /// Human-readable peer, as the transport describes it.
    pub fn peer_name(&self) -> String {
        self.engine.describe(&self.channel.peer)
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Why the channel closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.channel.lock().close_reason
    }

    /// Reason the peer gave in its CLOSE, once one has arrived.
    pub fn peer_close_reason(&self) -> Option<CloseReason> {
        self.channel.lock().peer_reason
    }

    /// Negotiated datagram size.
    pub fn mtu(&self) -> usize {
        self.channel.lock().mtu
    }

    /// Set while [`PacketStream::pull_bytes`] would return data at once.
    pub fn source_event(&self) -> &Event {
        &self.channel.source_event
    }

    /// Set while [`PacketStream::push_bytes`] can queue at least one packet.
    pub fn sink_event(&self) -> &Event {
        &self.channel.sink_event
    }

    /// Bound on how long a push waits for window space; `None` waits
    /// forever.
    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    pub fn set_context(&mut self, context: Option<StreamContext>) {
        self.context = context;
    }

    pub fn context(&self) -> Option<&StreamContext> {
        self.context.as_ref()
    }

    /// Read in-order bytes, waiting up to `timeout` (`None` = forever).
    pub async fn pull_bytes(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, EngineError> {
        self.engine.pull_on(&self.channel, buf, timeout).await
    }

    /// Send bytes that never expire.
    pub async fn push_bytes(&self, buf: &[u8]) -> Result<usize, EngineError> {
        self.push_bytes_with_ttl(buf, 0).await
    }

    /// Send bytes that the engine may drop once `ttl_ms` milliseconds have
    /// passed. `0` never expires.
    pub async fn push_bytes_with_ttl(&self, buf: &[u8], ttl_ms: u32) -> Result<usize, EngineError> {
        self.engine
            .push_on(&self.channel, buf, ttl_ms, self.send_timeout)
            .await
    }

    /// Close the channel and notify the peer.
    pub async fn close(&self) {
        self.engine.close_channel(&self.channel, CloseReason::Local).await;
    }
}

impl<T: PacketTransport> Clone for PacketStream<T> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            channel: Arc::clone(&self.channel),
            send_timeout: self.send_timeout,
            context: self.context.clone(),
        }
    }
}

impl<T: PacketTransport> std::fmt::Debug for PacketStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream")
            .field("channel_id", &format_args!("{:#010x}", self.channel.id))
            .field("peer", &self.channel.peer)
            .field("state", &self.channel.state())
            .finish()
    }
}
