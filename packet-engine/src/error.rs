//! Error types shared by every layer of the engine.
//!
//! Three layers:
//! - [`PacketError`]: a datagram failed framing checks (dropped and counted).
//! - [`TransportError`]: the datagram channel below the engine failed.
//! - [`EngineError`]: what callers of the engine and of
//!   [`crate::stream::PacketStream`] actually see.
//!
//! Framing and transport errors are recovered inside the engine; only
//! [`EngineError`] crosses the public API boundary.

use thiserror::Error;

// ---------------------------------------------------------------------------
// CloseReason
// ---------------------------------------------------------------------------

/// Why a channel stopped being usable.
///
/// Carried by [`EngineError::ChannelClosed`] and, for peer-visible reasons,
/// encoded into the CLOSE control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// The peer sent CLOSE (or answered our data with CLOSE).
    Peer,
    /// A packet used up every send attempt without being acknowledged.
    NoResponseToAllRetries,
    /// The engine was stopped.
    EngineStopped,
}

impl CloseReason {
    /// Wire code placed in the CLOSE control message.
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Local => 1,
            Self::Peer => 2,
            Self::NoResponseToAllRetries => 3,
            Self::EngineStopped => 4,
        }
    }

    /// Decode a wire code into the reason as the peer saw it. Unknown codes
    /// become [`CloseReason::Peer`].
    pub fn from_wire(code: u16) -> Self {
        match code {
            1 => Self::Local,
            3 => Self::NoResponseToAllRetries,
            4 => Self::EngineStopped,
            _ => Self::Peer,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Peer => write!(f, "closed by peer"),
            Self::NoResponseToAllRetries => write!(f, "no response to all retries"),
            Self::EngineStopped => write!(f, "engine stopped"),
        }
    }
}

// ---------------------------------------------------------------------------
// PacketError
// ---------------------------------------------------------------------------

/// A received datagram could not be turned into a [`crate::packet::Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Fewer bytes than a header arrived.
    #[error("datagram too short for a packet header ({0} bytes)")]
    BadFormat(usize),
    /// The CRC in the header does not match the recomputed value.
    #[error("CRC mismatch: header says {stored:#06x}, computed {computed:#06x}")]
    BadCrc { stored: u16, computed: u16 },
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Failures reported by a [`crate::transport::PacketTransport`].
///
/// None of these ever mutate engine state; the engine waits for readiness
/// and tries again.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying socket would block.
    #[error("transport busy")]
    Busy,
    /// The destination could not be resolved.
    #[error("destination unreachable")]
    Unreachable,
    /// No datagram arrived before the pull timeout.
    #[error("timed out waiting for a datagram")]
    TimedOut,
    /// Any other OS-level failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by [`crate::engine::PacketEngine`] and
/// [`crate::stream::PacketStream`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// A datagram was too short or structurally invalid.
    #[error("bad packet format")]
    BadFormat,
    /// A datagram failed its CRC check.
    #[error("bad packet CRC")]
    BadCrc,
    /// The lower layer reported a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A caller or handshake time budget ran out.
    #[error("operation timed out")]
    Timeout,
    /// The send window stayed full for the whole send timeout.
    #[error("send window full")]
    WouldBlock,
    /// The channel is closed and can no longer be used.
    #[error("channel closed: {0}")]
    ChannelClosed(CloseReason),
    /// The open exchange never completed.
    #[error("channel handshake failed")]
    HandshakeFailed,
    /// `stop()` has been called on the engine.
    #[error("packet engine stopped")]
    EngineStopped,
    /// No channel with this id exists.
    #[error("unknown channel {0:#010x}")]
    UnknownChannel(u32),
    /// An [`crate::config::EngineConfig`] value is unusable.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<PacketError> for EngineError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::BadFormat(_) => Self::BadFormat,
            PacketError::BadCrc { .. } => Self::BadCrc,
        }
    }
}
