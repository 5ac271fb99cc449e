//! Engine-wide counters.
//!
//! Framing errors and TTL drops are never reported to callers; these
//! counters are the only place they show up.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by the engine workers.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    retransmissions: AtomicU64,
    fast_retransmissions: AtomicU64,
    bad_crc: AtomicU64,
    bad_format: AtomicU64,
    tx_ttl_drops: AtomicU64,
    rx_ttl_drops: AtomicU64,
    duplicates: AtomicU64,
    rx_queue_full: AtomicU64,
    transport_errors: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    /// Data packets sent more than once (timer and fast retransmits).
    pub retransmissions: u64,
    pub fast_retransmissions: u64,
    pub bad_crc: u64,
    pub bad_format: u64,
    /// Packets dropped by the sender because their TTL ran out.
    pub tx_ttl_drops: u64,
    /// Packets dropped by the receiver because their TTL ran out.
    pub rx_ttl_drops: u64,
    pub duplicates: u64,
    /// Data packets refused because the reader had not caught up.
    pub rx_queue_full: u64,
    pub transport_errors: u64,
    /// Packets abandoned after the last attempt.
    pub exhausted: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub(crate) fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl EngineMetrics {
    counter!(add_sent, datagrams_sent);
    counter!(add_received, datagrams_received);
    counter!(add_retransmissions, retransmissions);
    counter!(add_fast_retransmissions, fast_retransmissions);
    counter!(add_bad_crc, bad_crc);
    counter!(add_bad_format, bad_format);
    counter!(add_tx_ttl_drops, tx_ttl_drops);
    counter!(add_rx_ttl_drops, rx_ttl_drops);
    counter!(add_duplicates, duplicates);
    counter!(add_rx_queue_full, rx_queue_full);
    counter!(add_transport_errors, transport_errors);
    counter!(add_exhausted, exhausted);

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            datagrams_sent: get(&self.datagrams_sent),
            datagrams_received: get(&self.datagrams_received),
            retransmissions: get(&self.retransmissions),
            fast_retransmissions: get(&self.fast_retransmissions),
            bad_crc: get(&self.bad_crc),
            bad_format: get(&self.bad_format),
            tx_ttl_drops: get(&self.tx_ttl_drops),
            rx_ttl_drops: get(&self.rx_ttl_drops),
            duplicates: get(&self.duplicates),
            rx_queue_full: get(&self.rx_queue_full),
            transport_errors: get(&self.transport_errors),
            exhausted: get(&self.exhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = EngineMetrics::default();
        m.add_sent(3);
        m.add_sent(2);
        m.add_bad_crc(1);
        let s = m.snapshot();
        assert_eq!(s.datagrams_sent, 5);
        assert_eq!(s.bad_crc, 1);
        assert_eq!(s.retransmissions, 0);
    }
}
