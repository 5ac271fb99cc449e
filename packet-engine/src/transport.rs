//! The unreliable datagram channel the engine runs on top of.
//!
//! A [`PacketTransport`] only moves bytes. Ordering, loss and duplication
//! are the engine's problem. Peers are identified by an opaque
//! [`PacketDest`] token that the engine stores and hands back without ever
//! looking inside it.

use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;

/// Size of the opaque peer token. Large enough for a packed `sockaddr_in`.
pub const PACKET_DEST_LEN: usize = 16;

/// Opaque transport-level identity of a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketDest {
    data: [u8; PACKET_DEST_LEN],
}

impl PacketDest {
    pub const fn new(data: [u8; PACKET_DEST_LEN]) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_DEST_LEN] {
        &self.data
    }
}

impl std::fmt::Debug for PacketDest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketDest(")?;
        for b in &self.data {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// An unreliable, MTU-bounded datagram channel.
///
/// Both directions must use the same MTU as the engine's packet pool; the
/// engine takes the smaller of the two and its own configured MTU.
pub trait PacketTransport: Send + Sync + 'static {
    /// Largest datagram [`PacketTransport::pull_packet_bytes`] can produce.
    fn source_mtu(&self) -> usize;

    /// Largest datagram [`PacketTransport::push_packet_bytes`] accepts.
    fn sink_mtu(&self) -> usize;

    /// Send all of `buf` to `dest`, or nothing.
    ///
    /// Fails with [`TransportError::Busy`] when the send would block and
    /// [`TransportError::Unreachable`] when `dest` cannot be resolved.
    fn push_packet_bytes(
        &self,
        buf: &[u8],
        dest: &PacketDest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait up to `timeout` for one datagram, copy it into `buf` and return
    /// its length together with the sender's identity.
    fn pull_packet_bytes(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<(usize, PacketDest), TransportError>> + Send;

    /// Resolves once the next pull is expected to make progress.
    fn source_ready(&self) -> impl Future<Output = ()> + Send;

    /// Resolves once the next push is expected to make progress.
    fn sink_ready(&self) -> impl Future<Output = ()> + Send;

    /// Human-readable form of a peer identity, for logs.
    fn describe(&self, dest: &PacketDest) -> String {
        format!("{dest:?}")
    }
}
