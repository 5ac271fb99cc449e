//! Finite-state-machine types for channels, handshakes and in-flight packets.
//!
//! Transitions are driven by [`crate::engine`]; this module only names the
//! states so they can be logged, asserted on and reasoned about in one place.

/// Lifecycle of one logical channel.
///
/// ```text
///  Opening ──handshake done──▶ Open ──close()──▶ Closing ──drained──▶ Closed
///     │                          │                                      ▲
///     └── handshake failed ──────┴──── peer CLOSE / retries exhausted ──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Handshake in progress.
    #[default]
    Opening,
    /// Data may flow in both directions.
    Open,
    /// Local close requested; the send window is draining.
    Closing,
    /// Terminal. Every operation fails with `ChannelClosed`.
    Closed,
}

impl ChannelState {
    /// `true` for `Closing` and `Closed`.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which side of the open exchange a channel was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent CLIENT_HELLO.
    Client,
    /// Answered with SERVER_HELLO.
    Server,
}

/// Progress through the channel-0 open exchange.
///
/// ```text
///  client                           server
///    │ ── CLIENT_HELLO(win, mtu) ──▶  │   ClientHello
///    │ ◀── SERVER_HELLO(win, mtu) ──  │   ServerHello
///    │ ── CLIENT_ACK ──────────────▶  │   ClientAck
///    Open                           Open
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Client has sent (or is re-sending) CLIENT_HELLO.
    ClientHello,
    /// Server has answered and waits for CLIENT_ACK.
    ServerHello,
    /// Client has acknowledged SERVER_HELLO.
    ClientAck,
    /// Both sides agree on window and MTU.
    Open,
}

/// Where one in-flight packet stands in the retransmission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Queued, waiting for the send worker to pick it.
    AwaitingTransmitSlot,
    /// Sent at least once; retry timer running.
    AwaitingResponse,
    /// Acknowledged by the peer; leaves the window.
    ReceivedSuccessResponse,
    /// Every attempt was used without an acknowledgement.
    NoResponseToAllRetries,
    /// Discarded because the channel closed before it was acknowledged.
    Error,
}

impl std::fmt::Display for PacketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AwaitingTransmitSlot => "awaiting transmit slot",
            Self::AwaitingResponse => "awaiting response",
            Self::ReceivedSuccessResponse => "acknowledged",
            Self::NoResponseToAllRetries => "no response to all retries",
            Self::Error => "discarded",
        };
        f.write_str(name)
    }
}
