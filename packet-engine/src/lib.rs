//! `packet-engine`: reliable, ordered, TTL-aware channels multiplexed over
//! an unreliable datagram transport.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  push_bytes / pull_bytes  ┌──────────────┐
//!  │ PacketStream │◀─────────────────────────▶│ PacketEngine │
//!  └──────────────┘                           └──────┬───────┘
//!                                                    │ per channel
//!                               ┌────────────────────┼────────────────────┐
//!                               │                    │                    │
//!                         ┌─────▼────┐         ┌─────▼────┐         ┌─────▼────┐
//!                         │ TxWindow │         │ RxWindow │         │ handshake│
//!                         └─────┬────┘         └─────▲────┘         └─────┬────┘
//!                               │ Packet (pooled)    │                    │ ControlMessage
//!                         ┌─────▼────────────────────┴────────────────────▼────┐
//!                         │              PacketTransport                       │
//!                         │        (UdpTransport, SimTransport, ...)           │
//!                         └────────────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]:     wire format (serialise / deserialise, CRC, TTL)
//! - [`crc16`]:      CRC-16 over header and payload
//! - [`control`]:    handshake, ACK and CLOSE messages on channel 0
//! - [`pool`]:       recycling of MTU-sized packet buffers
//! - [`transport`]:  the datagram abstraction the engine runs on
//! - [`engine`]:     channel table, handshake, send and receive workers
//! - [`stream`]:     per-channel byte-stream handle
//! - [`tx_window`]:  outbound sliding window and retransmit selection
//! - [`rx_window`]:  inbound reordering, gap skipping and read queue
//! - [`retry`]:      retransmit back-off schedule
//! - [`state`]:      finite-state-machine types
//! - [`event`]:      awaitable source/sink readiness flags
//! - [`config`]:     engine tunables
//! - [`metrics`]:    engine counters
//! - [`udp`]:        UDP implementation of [`PacketTransport`]
//! - [`simulator`]:  lossy/reordering in-memory network for testing

mod channel;
pub mod config;
pub mod control;
pub mod crc16;
pub mod engine;
pub mod error;
pub mod event;
pub mod metrics;
pub mod packet;
pub mod pool;
pub mod retry;
pub mod rx_window;
pub mod simulator;
pub mod state;
pub mod stream;
pub mod transport;
pub mod tx_window;
pub mod udp;

pub use config::{EngineConfig, ExpiredSendPolicy};
pub use engine::PacketEngine;
pub use error::{CloseReason, EngineError, PacketError, TransportError};
pub use event::Event;
pub use metrics::MetricsSnapshot;
pub use packet::Packet;
pub use pool::PacketPool;
pub use retry::RetrySchedule;
pub use simulator::{SimNetwork, SimTransport, SimulatorConfig};
pub use state::ChannelState;
pub use stream::{PacketStream, StreamContext};
pub use transport::{PacketDest, PacketTransport};
pub use udp::UdpTransport;
