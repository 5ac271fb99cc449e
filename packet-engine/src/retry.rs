//! Retransmission timing.
//!
//! Every in-flight packet waits a fixed amount of time for its
//! acknowledgement before it is sent again. The wait depends only on how many
//! times the packet has already been sent: 200 ms after the first attempt,
//! 400 ms after the second, 500 ms after every later one. After the last
//! permitted attempt the packet is abandoned.
//!
//! The same schedule bounds the channel-open handshake, so a silent peer is
//! detected after `200 + 400 + 7 × 500 = 4100 ms` with the defaults.

use std::time::Duration;

use tokio::time::Instant;

/// Default cap on transmissions of a single packet.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 9;

/// Per-attempt acknowledgement waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Wait after attempt `i` is `slots[i - 1]`; the last slot repeats.
    slots: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(500),
        ])
    }
}

impl RetrySchedule {
    /// Build a schedule from explicit slots. An empty list behaves as a
    /// single 500 ms slot.
    pub fn new(slots: Vec<Duration>) -> Self {
        if slots.is_empty() {
            return Self {
                slots: vec![Duration::from_millis(500)],
            };
        }
        Self { slots }
    }

    /// Same wait after every attempt.
    pub fn uniform(wait: Duration) -> Self {
        Self::new(vec![wait])
    }

    /// How long to wait for an acknowledgement after attempt `attempt`
    /// (1-indexed).
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        self.slots[idx.min(self.slots.len() - 1)]
    }

    /// Time from the first attempt until attempt `max_attempts` has also
    /// timed out.
    pub fn total_budget(&self, max_attempts: u32) -> Duration {
        (1..=max_attempts).map(|a| self.wait_after(a)).sum()
    }

    /// When a packet last sent at `sent_at` on attempt `attempts` is due
    /// again.
    pub fn deadline(&self, sent_at: Instant, attempts: u32) -> Instant {
        sent_at + self.wait_after(attempts)
    }
}
