//! Engine configuration.
//!
//! One [`EngineConfig`] value is handed to
//! [`crate::engine::PacketEngine::start`]; there is no process-wide state.

use std::time::Duration;

use crate::control::CONTROL_LEN;
use crate::error::EngineError;
use crate::packet::HEADER_LEN;
use crate::retry::{RetrySchedule, DEFAULT_MAX_ATTEMPTS};

/// Smallest MTU that still fits a control message.
pub const MIN_MTU: usize = HEADER_LEN + CONTROL_LEN;

/// Ethernet MTU minus IPv4 and UDP headers.
pub const DEFAULT_MTU: usize = 1472;

/// What the sender does with a packet whose TTL ran out before it could be
/// transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiredSendPolicy {
    /// Drop it silently; the bytes count as delivered.
    #[default]
    CountAsDelivered,
    /// Drop it and fail the next `push_bytes` on that channel with
    /// `WouldBlock`.
    SurfaceWouldBlock,
}

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on the datagram size; the transport's MTU may lower it.
    pub mtu: usize,
    /// Packets a channel may hold in its send window.
    pub window_size: u16,
    /// Acknowledgement waits per attempt.
    pub retry_schedule: RetrySchedule,
    /// Transmissions before a packet is abandoned.
    pub max_attempts: u32,
    /// Out-of-order distance beyond which the receiver asks for a fast
    /// retransmit.
    pub fast_retransmit_threshold: u16,
    /// Default bound on `push_bytes` waits; `None` waits forever.
    pub send_timeout: Option<Duration>,
    /// How long `close` waits for the send window to drain.
    pub close_linger: Duration,
    /// Packets a channel may hold on the receive side. Data beyond it is
    /// refused with a receiver-full ACK until the application reads.
    pub rx_queue_limit: usize,
    /// How long the receive worker blocks in one transport pull.
    pub pull_timeout: Duration,
    pub expired_send_policy: ExpiredSendPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            window_size: 16,
            retry_schedule: RetrySchedule::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fast_retransmit_threshold: 2,
            send_timeout: None,
            close_linger: Duration::from_secs(2),
            rx_queue_limit: 256,
            pull_timeout: Duration::from_millis(3000),
            expired_send_policy: ExpiredSendPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_window_size(mut self, window_size: u16) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_retry_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.retry_schedule = schedule;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_fast_retransmit_threshold(mut self, threshold: u16) -> Self {
        self.fast_retransmit_threshold = threshold;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_close_linger(mut self, linger: Duration) -> Self {
        self.close_linger = linger;
        self
    }

    pub fn with_rx_queue_limit(mut self, limit: usize) -> Self {
        self.rx_queue_limit = limit;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_expired_send_policy(mut self, policy: ExpiredSendPolicy) -> Self {
        self.expired_send_policy = policy;
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.mtu < MIN_MTU {
            return Err(EngineError::InvalidConfig("mtu smaller than header plus control message"));
        }
        if self.window_size == 0 {
            return Err(EngineError::InvalidConfig("window_size must be at least 1"));
        }
        // Half the sequence space must stay free to tell old from new.
        if self.window_size > 0x4000 {
            return Err(EngineError::InvalidConfig("window_size too large for 16-bit sequence numbers"));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidConfig("max_attempts must be at least 1"));
        }
        if self.rx_queue_limit == 0 {
            return Err(EngineError::InvalidConfig("rx_queue_limit must be at least 1"));
        }
        Ok(())
    }
}
