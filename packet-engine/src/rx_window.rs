//! Receive-side window for one channel.
//!
//! [`RxWindow`] turns the datagrams of one channel, which may arrive lost,
//! duplicated or out of order, into the in-order byte stream the
//! application reads:
//!
//! - A packet numbered `expected` is delivered at once, followed by any
//!   buffered successors it unblocks.
//! - A packet from the future is buffered in sequence order.
//! - A packet from the past is a duplicate; the caller acknowledges it again
//!   so a sender that missed the first ACK can let go.
//! - `seq_num - gap` names the oldest packet the sender still holds. Any
//!   hole below it can never be filled, so the window skips past it.
//! - Expired packets are consumed but never handed to the application.
//!
//! This module only manages state; acknowledgements are the caller's job.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::packet::Packet;
use crate::tx_window::seq_lt;

/// How an arriving packet was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    /// It was the next expected packet.
    Accepted,
    /// Held for reordering. `gap_ack` asks the sender to resend the
    /// missing packet right away.
    Buffered { gap_ack: bool },
    /// Seen before.
    Duplicate,
    /// No room; dropped. The caller tells the sender to try again later.
    Overflow,
}

/// Result of [`RxWindow::on_packet`].
#[derive(Debug)]
pub struct RxOutcome {
    pub verdict: RxVerdict,
    /// Packets to return to the pool.
    pub recycle: Vec<Packet>,
    /// How many of the recycled packets expired before delivery.
    pub expired: usize,
}

/// Result of [`RxWindow::read`].
#[derive(Debug, Default)]
pub struct RxRead {
    pub bytes: usize,
    pub recycle: Vec<Packet>,
    pub expired: usize,
}

#[derive(Debug)]
pub struct RxWindow {
    /// Next sequence number to deliver.
    expected: u16,
    /// Future packets, sorted by distance from `expected`.
    reorder: VecDeque<Packet>,
    /// In-order packets waiting for the application.
    ready: VecDeque<Packet>,
    /// Bytes of `ready.front()` already read.
    read_offset: usize,
    limit: usize,
    /// `expected` value the last gap-ack was sent for.
    gap_acked: Option<u16>,
}

impl RxWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            expected: 0,
            reorder: VecDeque::new(),
            ready: VecDeque::new(),
            read_offset: 0,
            limit: limit.max(1),
            gap_acked: None,
        }
    }

    /// Cumulative acknowledgement value: every packet before it is done.
    pub fn expected(&self) -> u16 {
        self.expected
    }

    /// `true` while unread bytes are queued.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Packets held for reordering.
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Handle one data packet.
    pub fn on_packet(&mut self, packet: Packet, now: Instant, fast_threshold: u16) -> RxOutcome {
        let mut out = RxOutcome {
            verdict: RxVerdict::Duplicate,
            recycle: Vec::new(),
            expired: 0,
        };

        if packet.gap < 0x8000 {
            let floor = packet.seq_num.wrapping_sub(packet.gap);
            if seq_lt(self.expected, floor) {
                self.skip_to(floor, now, &mut out);
            }
        }

        let seq = packet.seq_num;
        if seq == self.expected {
            if self.ready.len() >= self.limit {
                out.verdict = RxVerdict::Overflow;
                out.recycle.push(packet);
                return out;
            }
            self.deliver(packet, now, &mut out);
            self.expected = self.expected.wrapping_add(1);
            self.drain_reorder(now, &mut out);
            out.verdict = RxVerdict::Accepted;
        } else if seq_lt(self.expected, seq) {
            if self.reorder.iter().any(|p| p.seq_num == seq) {
                out.recycle.push(packet);
                return out;
            }
            if self.ready.len() + self.reorder.len() >= self.limit {
                out.verdict = RxVerdict::Overflow;
                out.recycle.push(packet);
                return out;
            }
            let dist = seq.wrapping_sub(self.expected);
            let idx = self
                .reorder
                .iter()
                .position(|p| p.seq_num.wrapping_sub(self.expected) > dist)
                .unwrap_or(self.reorder.len());
            self.reorder.insert(idx, packet);

            let gap_ack = dist > fast_threshold && self.gap_acked != Some(self.expected);
            if gap_ack {
                self.gap_acked = Some(self.expected);
            }
            out.verdict = RxVerdict::Buffered { gap_ack };
        } else {
            out.recycle.push(packet);
        }
        out
    }

    /// Copy in-order bytes into `buf`. Expired packets at the head are
    /// skipped; a packet already partly read is always finished.
    pub fn read(&mut self, buf: &mut [u8], now: Instant) -> RxRead {
        let mut out = RxRead::default();
        while out.bytes < buf.len() {
            let Some(front) = self.ready.front() else {
                break;
            };
            if self.read_offset == 0 && front.is_expired(now) {
                if let Some(p) = self.ready.pop_front() {
                    out.expired += 1;
                    out.recycle.push(p);
                }
                continue;
            }
            let src = &front.payload()[self.read_offset..];
            let n = src.len().min(buf.len() - out.bytes);
            buf[out.bytes..out.bytes + n].copy_from_slice(&src[..n]);
            out.bytes += n;
            self.read_offset += n;
            if self.read_offset == front.payload_len() {
                self.read_offset = 0;
                if let Some(p) = self.ready.pop_front() {
                    out.recycle.push(p);
                }
            }
        }
        out
    }

    /// Drop packets still waiting for a hole to fill; keep readable ones.
    pub fn discard_pending(&mut self) -> Vec<Packet> {
        self.reorder.drain(..).collect()
    }

    /// Remove every held packet.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.read_offset = 0;
        let mut all: Vec<Packet> = self.ready.drain(..).collect();
        all.extend(self.reorder.drain(..));
        all
    }

    fn skip_to(&mut self, floor: u16, now: Instant, out: &mut RxOutcome) {
        while let Some(front) = self.reorder.front() {
            if !seq_lt(front.seq_num, floor) {
                break;
            }
            if let Some(p) = self.reorder.pop_front() {
                self.deliver(p, now, out);
            }
        }
        self.expected = floor;
        self.drain_reorder(now, out);
    }

    fn drain_reorder(&mut self, now: Instant, out: &mut RxOutcome) {
        while let Some(front) = self.reorder.front() {
            if front.seq_num != self.expected {
                break;
            }
            if let Some(p) = self.reorder.pop_front() {
                self.deliver(p, now, out);
                self.expected = self.expected.wrapping_add(1);
            }
        }
    }

    fn deliver(&mut self, packet: Packet, now: Instant, out: &mut RxOutcome) {
        if packet.is_expired(now) {
            out.expired += 1;
            out.recycle.push(packet);
        } else if packet.payload_len() == 0 {
            out.recycle.push(packet);
        } else {
            self.ready.push_back(packet);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
