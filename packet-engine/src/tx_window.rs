//! Send-side window for one channel.
//!
//! [`TxWindow`] owns every data packet a channel has accepted from the
//! application but not yet seen acknowledged. It decides which packet the
//! send worker should transmit next; it never touches a transport.
//!
//! # Protocol contract
//!
//! - At most `capacity` packets are held at once.
//! - Sequence numbers are 16-bit and wrap; two numbers are compared as
//!   "close" when they are less than half the space apart.
//! - An ACK removes the packet it names plus every packet before its
//!   cumulative sequence number.
//! - Packets whose TTL runs out are dropped before they are sent again.
//! - Pick order: fast-retransmit requests, then packets whose retry timer
//!   fired, then packets never sent.
//!
//! ```text
//!  oldest_seq                         next_seq
//!      │                                  │
//!  ────┼──────────────────────────────────┼──────────▶ seq space
//!      │ <── held (sent or waiting) ────▶ │
//! ```

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::packet::Packet;
use crate::retry::RetrySchedule;
use crate::state::PacketState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns `true` when `a` comes strictly before `b` in wrap-around space.
#[inline]
pub(crate) fn seq_lt(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

/// When a sent packet's retry timer fires; `None` if it was never sent.
fn retry_due(p: &Packet, schedule: &RetrySchedule) -> Option<Instant> {
    p.send_ts
        .filter(|_| p.send_attempts > 0)
        .map(|sent_at| schedule.deadline(sent_at, p.send_attempts))
}

/// State of a sent packet whose retry timer fires at `due`.
fn packet_state(attempts: u32, due: Instant, now: Instant, max_attempts: u32) -> PacketState {
    if due > now {
        PacketState::AwaitingResponse
    } else if attempts >= max_attempts {
        PacketState::NoResponseToAllRetries
    } else {
        PacketState::AwaitingTransmitSlot
    }
}

// ---------------------------------------------------------------------------
// TxPoll
// ---------------------------------------------------------------------------

/// What the send worker should do next for this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    /// Transmit the packet with this sequence number.
    Send { seq: u16, fast: bool },
    /// The packet used every attempt; the channel has to close.
    Exhausted { seq: u16 },
    /// Nothing due; wake up again at `next_deadline` (if any).
    Idle { next_deadline: Option<Instant> },
}

/// Result of [`TxWindow::poll`].
#[derive(Debug)]
pub struct TxPoll {
    /// Packets dropped because their TTL ran out. Return them to the pool.
    pub expired: Vec<Packet>,
    pub action: TxAction,
}

// ---------------------------------------------------------------------------
// TxWindow
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TxWindow {
    next_seq: u16,
    capacity: usize,
    /// Held packets in sequence order (front = oldest).
    entries: VecDeque<Packet>,
}

impl TxWindow {
    /// Empty window starting at sequence number 0.
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 0,
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Change the window size, e.g. after the handshake picked a smaller one.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` while another packet fits.
    pub fn has_space(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Sequence number the next accepted packet will get.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// Sequence number of the oldest held packet.
    pub fn oldest_seq(&self) -> Option<u16> {
        self.entries.front().map(|p| p.seq_num)
    }

    /// Stamp `packet` with the next sequence number and hold it, or hand it
    /// back when the window is full.
    pub fn try_push(&mut self, mut packet: Packet) -> Result<u16, Packet> {
        if !self.has_space() {
            return Err(packet);
        }
        let seq = self.next_seq;
        packet.seq_num = seq;
        packet.send_attempts = 0;
        packet.send_ts = None;
        packet.fast_retransmit = false;
        self.entries.push_back(packet);
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(seq)
    }

    /// Where the packet with `seq` stands, if it is still held.
    pub fn state_of(
        &self,
        seq: u16,
        now: Instant,
        schedule: &RetrySchedule,
        max_attempts: u32,
    ) -> Option<PacketState> {
        self.find(seq).map(|p| match retry_due(p, schedule) {
            None => PacketState::AwaitingTransmitSlot,
            Some(due) => packet_state(p.send_attempts, due, now, max_attempts),
        })
    }

    /// Process an acknowledgement.
    ///
    /// Removes the packet numbered `seq` and every sent packet before
    /// `cumulative`. Returns the removed packets. A `cumulative` value that
    /// lies outside the held range is ignored.
    pub fn on_ack(&mut self, cumulative: u16, seq: u16) -> Vec<Packet> {
        self.remove_acked(cumulative, Some(seq))
    }

    /// Process an acknowledgement that says the receiver had no room for
    /// `seq`.
    ///
    /// Packets before `cumulative` are removed as in [`TxWindow::on_ack`].
    /// `seq` stays held: its retry timer restarts at `now` and the attempt
    /// that reached the full receiver is taken back, so a slow reader never
    /// uses up the retry budget.
    pub fn on_receiver_full(&mut self, cumulative: u16, seq: u16, now: Instant) -> Vec<Packet> {
        let acked = self.remove_acked(cumulative, None);
        if let Some(p) = self.entries.iter_mut().find(|p| p.seq_num == seq) {
            if p.send_attempts > 0 {
                p.send_attempts = (p.send_attempts - 1).max(1);
                p.send_ts = Some(now);
                p.fast_retransmit = false;
            }
        }
        acked
    }

    fn remove_acked(&mut self, cumulative: u16, seq: Option<u16>) -> Vec<Packet> {
        let Some(oldest) = self.oldest_seq() else {
            return Vec::new();
        };
        let span = self.next_seq.wrapping_sub(oldest);
        let cumulative_ok = cumulative.wrapping_sub(oldest) <= span;

        let mut acked = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let p = &self.entries[i];
            let covered = p.send_attempts > 0
                && (Some(p.seq_num) == seq || (cumulative_ok && seq_lt(p.seq_num, cumulative)));
            if covered {
                if let Some(p) = self.entries.remove(i) {
                    acked.push(p);
                }
            } else {
                i += 1;
            }
        }
        acked
    }

    /// Flag the packet numbered `seq` for immediate resend. Returns `false`
    /// when it is not held, was never sent, or is already flagged.
    pub fn mark_fast_retransmit(&mut self, seq: u16) -> bool {
        match self.entries.iter_mut().find(|p| p.seq_num == seq) {
            Some(p) if p.send_attempts > 0 && !p.fast_retransmit => {
                p.fast_retransmit = true;
                true
            }
            _ => false,
        }
    }

    /// Drop expired packets and decide what to transmit next.
    pub fn poll(&mut self, now: Instant, schedule: &RetrySchedule, max_attempts: u32) -> TxPoll {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].is_expired(now) {
                if let Some(p) = self.entries.remove(i) {
                    expired.push(p);
                }
            } else {
                i += 1;
            }
        }
        TxPoll {
            expired,
            action: self.pick(now, schedule, max_attempts),
        }
    }

    fn pick(&self, now: Instant, schedule: &RetrySchedule, max_attempts: u32) -> TxAction {
        if let Some(p) = self
            .entries
            .iter()
            .find(|p| p.fast_retransmit && p.send_attempts < max_attempts)
        {
            return TxAction::Send { seq: p.seq_num, fast: true };
        }

        let mut fresh = None;
        let mut next_deadline: Option<Instant> = None;
        for p in &self.entries {
            let Some(due) = retry_due(p, schedule) else {
                fresh = fresh.or(Some(p.seq_num));
                continue;
            };
            match packet_state(p.send_attempts, due, now, max_attempts) {
                PacketState::NoResponseToAllRetries => return TxAction::Exhausted { seq: p.seq_num },
                PacketState::AwaitingTransmitSlot => return TxAction::Send { seq: p.seq_num, fast: false },
                _ => next_deadline = Some(next_deadline.map_or(due, |d| d.min(due))),
            }
        }

        match fresh {
            Some(seq) => TxAction::Send { seq, fast: false },
            None => TxAction::Idle { next_deadline },
        }
    }

    /// Fill in the gap field, marshal the packet numbered `seq` into
    /// `scratch` and return the attempt number this transmission will be.
    pub fn prepare(&mut self, seq: u16, now: Instant, scratch: &mut Vec<u8>) -> Option<u32> {
        let oldest = self.oldest_seq()?;
        let p = self.entries.iter_mut().find(|p| p.seq_num == seq)?;
        p.gap = seq.wrapping_sub(oldest);
        scratch.clear();
        scratch.extend_from_slice(p.marshal(now));
        Some(p.send_attempts + 1)
    }

    /// Record that the packet numbered `seq` went out at `now`.
    pub fn mark_sent(&mut self, seq: u16, now: Instant) {
        if let Some(p) = self.entries.iter_mut().find(|p| p.seq_num == seq) {
            p.send_attempts += 1;
            p.send_ts = Some(now);
            p.fast_retransmit = false;
        }
    }

    /// Remove every held packet, oldest first.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.entries.drain(..).collect()
    }

    fn find(&self, seq: u16) -> Option<&Packet> {
        self.entries.iter().find(|p| p.seq_num == seq)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
