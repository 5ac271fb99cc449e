//! Wire-format definitions for engine packets.
//!
//! Every datagram exchanged between two engines is one [`Packet`]. A packet
//! owns a buffer of exactly MTU bytes; the header is assembled in place at
//! the front of that buffer and the payload always lives at
//! [`PAYLOAD_OFFSET`], so marshalling never reallocates.
//!
//! No I/O happens here except in [`Packet::unmarshal_from`], which pulls one
//! datagram from a transport straight into the owned buffer.
//!
//! # Wire format
//!
//! All multi-byte integers are **little-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Channel Id                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |              Gap              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |     Flags     |            CRC-16             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       TTL (milliseconds)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Payload ...                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The CRC covers the first ten header bytes followed by the payload. A TTL
//! of `0xFFFF_FFFF` means "never expires"; a TTL of zero means the sender
//! already considered the packet past due.

use std::time::Duration;

use tokio::time::Instant;

use crate::crc16::crc16_update;
use crate::error::{EngineError, PacketError};
use crate::transport::{PacketDest, PacketTransport};

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Payload is a control message; only valid on channel 0.
    pub const CONTROL: u8 = 0b0000_0001;
    /// Data packet; the receiver must acknowledge it.
    pub const ACK_REQUIRED: u8 = 0b0000_0010;
    /// On an ACK control message: resend the packet at `cumulative` now.
    pub const FAST_RETRANSMIT: u8 = 0b0000_0100;
    /// On an ACK control message: the receive queue is full and `seq` was
    /// not kept. Resend later without spending an attempt.
    pub const RECEIVER_FULL: u8 = 0b0000_1000;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 16;

/// Offset of the payload inside the packet buffer. Four-byte aligned.
pub const PAYLOAD_OFFSET: usize = HEADER_LEN;

/// Protocol version written by [`Packet::marshal`].
pub const PACKET_VERSION: u8 = 1;

/// On-wire TTL meaning "no expiration".
pub const TTL_INFINITE: u32 = u32::MAX;

// Byte offsets of each field within the serialised header.
const OFF_CHAN_ID: usize = 0;
const OFF_SEQ: usize = 4;
const OFF_GAP: usize = 6;
const OFF_VERSION: usize = 8;
const OFF_FLAGS: usize = 9;
const OFF_CRC: usize = 10;
const OFF_TTL: usize = 12;

// ---------------------------------------------------------------------------
// PacketId
// ---------------------------------------------------------------------------

/// Stable index the [`crate::pool::PacketPool`] assigns to every packet it
/// creates. Packets built outside a pool carry [`PacketId::DETACHED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub(crate) u32);

impl PacketId {
    /// Id of a packet that does not belong to any pool.
    pub const DETACHED: PacketId = PacketId(0);
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One on-wire frame plus the transient retransmission state the engine
/// keeps alongside it.
#[derive(Debug)]
pub struct Packet {
    id: PacketId,

    /// Logical channel; 0 is the control channel.
    pub chan_id: u32,
    /// Per-channel sequence number (wraps).
    pub seq_num: u16,
    /// Distance back to the oldest packet the sender still holds.
    pub gap: u16,
    /// Protocol version seen on the wire (set by marshal/unmarshal).
    pub version: u8,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Absolute expiration; `None` never expires.
    pub expire_at: Option<Instant>,
    /// CRC computed by the last marshal or verified by the last unmarshal.
    pub crc16: u16,

    /// Time of the most recent successful transmission.
    pub send_ts: Option<Instant>,
    /// How many times this packet has been handed to the transport.
    pub send_attempts: u32,
    /// Peer reported this packet missing; resend before anything else.
    pub fast_retransmit: bool,
    /// Transport identity captured on ingress.
    pub sender: Option<PacketDest>,

    payload_len: usize,
    buffer: Box<[u8]>,
}

impl Packet {
    /// Allocate a packet that is not owned by any pool.
    ///
    /// # Panics
    ///
    /// Panics if `mtu` cannot hold a header.
    pub fn new(mtu: usize) -> Self {
        Self::with_id(PacketId::DETACHED, mtu)
    }

    pub(crate) fn with_id(id: PacketId, mtu: usize) -> Self {
        assert!(mtu > HEADER_LEN, "mtu {mtu} cannot hold a {HEADER_LEN}-byte header");
        Self {
            id,
            chan_id: 0,
            seq_num: 0,
            gap: 0,
            version: 0,
            flags: 0,
            expire_at: None,
            crc16: 0,
            send_ts: None,
            send_attempts: 0,
            fast_retransmit: false,
            sender: None,
            payload_len: 0,
            buffer: vec![0u8; mtu].into_boxed_slice(),
        }
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    /// Size of the owned buffer.
    pub fn mtu(&self) -> usize {
        self.buffer.len()
    }

    /// Largest payload this packet can carry.
    pub fn max_payload(&self) -> usize {
        self.buffer.len() - HEADER_LEN
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Payload bytes currently held in the buffer.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[PAYLOAD_OFFSET..PAYLOAD_OFFSET + self.payload_len]
    }

    /// Copy `min(src.len(), max_payload())` bytes into the payload region and
    /// return how many were taken.
    pub fn set_payload(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.max_payload());
        self.buffer[PAYLOAD_OFFSET..PAYLOAD_OFFSET + n].copy_from_slice(&src[..n]);
        self.payload_len = n;
        n
    }

    /// Writable view of the payload region, for filling it in place.
    ///
    /// Follow with [`Packet::set_payload_len`]; no copy happens in that case.
    pub fn payload_buf_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[PAYLOAD_OFFSET..]
    }

    /// Declare how many bytes of the payload region are in use. Clamped to
    /// [`Packet::max_payload`].
    pub fn set_payload_len(&mut self, len: usize) -> usize {
        self.payload_len = len.min(self.max_payload());
        self.payload_len
    }

    /// Stamp the expiration from a relative TTL. `0` means "never expires".
    pub fn set_ttl(&mut self, ttl_ms: u32, now: Instant) {
        self.expire_at = if ttl_ms == 0 {
            None
        } else {
            Some(now + Duration::from_millis(u64::from(ttl_ms)))
        };
    }

    /// On-wire TTL for this packet as of `now`.
    ///
    /// Never-expiring packets map to [`TTL_INFINITE`]; past-due packets map
    /// to zero; finite TTLs are clamped just below the sentinel.
    pub fn ttl_millis(&self, now: Instant) -> u32 {
        match self.expire_at {
            None => TTL_INFINITE,
            Some(at) if at <= now => 0,
            Some(at) => {
                let ms = (at - now).as_millis();
                u32::try_from(ms).map_or(TTL_INFINITE - 1, |v| v.min(TTL_INFINITE - 1))
            }
        }
    }

    /// `true` once the expiration time has been reached.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expire_at, Some(at) if at <= now)
    }

    /// Assemble the header in front of the payload, compute the CRC and
    /// return the bytes ready for the transport.
    pub fn marshal(&mut self, now: Instant) -> &[u8] {
        debug_assert!(self.payload_len <= self.max_payload());
        let ttl = self.ttl_millis(now);
        self.version = PACKET_VERSION;

        let buf = &mut self.buffer;
        buf[OFF_CHAN_ID..OFF_CHAN_ID + 4].copy_from_slice(&self.chan_id.to_le_bytes());
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq_num.to_le_bytes());
        buf[OFF_GAP..OFF_GAP + 2].copy_from_slice(&self.gap.to_le_bytes());
        buf[OFF_VERSION] = PACKET_VERSION;
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_TTL..OFF_TTL + 4].copy_from_slice(&ttl.to_le_bytes());

        let end = PAYLOAD_OFFSET + self.payload_len;
        let crc = crc16_update(crc16_update(0, &buf[..OFF_CRC]), &buf[PAYLOAD_OFFSET..end]);
        buf[OFF_CRC..OFF_CRC + 2].copy_from_slice(&crc.to_le_bytes());
        self.crc16 = crc;

        &self.buffer[..end]
    }

    /// Marshalled bytes from the last [`Packet::marshal`] call.
    pub fn wire(&self) -> &[u8] {
        &self.buffer[..PAYLOAD_OFFSET + self.payload_len]
    }

    /// Whole owned buffer, for a transport to receive into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Parse the first `len` bytes of the owned buffer as a datagram.
    ///
    /// On failure every header field is reset so no stale values leak into
    /// the caller.
    pub fn unmarshal(
        &mut self,
        len: usize,
        sender: Option<PacketDest>,
        now: Instant,
    ) -> Result<(), PacketError> {
        let result = self.parse(len, now);
        match result {
            Ok(()) => self.sender = sender,
            Err(_) => {
                self.chan_id = 0;
                self.seq_num = 0;
                self.gap = 0;
                self.version = 0;
                self.flags = 0;
                self.payload_len = 0;
                self.expire_at = None;
                self.crc16 = 0;
                self.sender = None;
            }
        }
        result
    }

    fn parse(&mut self, len: usize, now: Instant) -> Result<(), PacketError> {
        if len < HEADER_LEN || len > self.buffer.len() {
            return Err(PacketError::BadFormat(len));
        }
        let buf = &self.buffer[..len];

        let stored = u16::from_le_bytes([buf[OFF_CRC], buf[OFF_CRC + 1]]);
        let computed = crc16_update(crc16_update(0, &buf[..OFF_CRC]), &buf[PAYLOAD_OFFSET..]);
        if stored != computed {
            return Err(PacketError::BadCrc { stored, computed });
        }
        if buf[OFF_VERSION] != PACKET_VERSION {
            return Err(PacketError::BadFormat(len));
        }

        self.chan_id = u32::from_le_bytes(read4(buf, OFF_CHAN_ID));
        self.seq_num = u16::from_le_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]);
        self.gap = u16::from_le_bytes([buf[OFF_GAP], buf[OFF_GAP + 1]]);
        self.version = buf[OFF_VERSION];
        self.flags = buf[OFF_FLAGS];
        self.crc16 = stored;
        let ttl = u32::from_le_bytes(read4(buf, OFF_TTL));
        self.expire_at = if ttl == TTL_INFINITE {
            None
        } else {
            Some(now + Duration::from_millis(u64::from(ttl)))
        };
        self.payload_len = len - PAYLOAD_OFFSET;
        Ok(())
    }

    /// Pull one datagram from `transport` into this packet and parse it.
    pub async fn unmarshal_from<T: PacketTransport>(
        &mut self,
        transport: &T,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let (len, sender) = transport.pull_packet_bytes(&mut self.buffer, timeout).await?;
        self.unmarshal(len, Some(sender), Instant::now())?;
        Ok(())
    }

    /// Reset all header and transient state; used when returning to a pool.
    pub fn clean(&mut self) {
        self.chan_id = 0;
        self.seq_num = 0;
        self.gap = 0;
        self.version = 0;
        self.flags = 0;
        self.expire_at = None;
        self.crc16 = 0;
        self.send_ts = None;
        self.send_attempts = 0;
        self.fast_retransmit = false;
        self.sender = None;
        self.payload_len = 0;
    }
}

fn read4(buf: &[u8], off: usize) -> [u8; 4] {
    [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(chan_id: u32, seq: u16, gap: u16, fl: u8, payload: &[u8]) -> Packet {
        let mut p = Packet::new(64);
        p.chan_id = chan_id;
        p.seq_num = seq;
        p.gap = gap;
        p.flags = fl;
        p.set_payload(payload);
        p
    }

    /// Marshal `src` and copy the wire bytes into a fresh packet's buffer.
    fn reparse(src: &mut Packet, now: Instant) -> (Packet, Result<(), PacketError>) {
        let wire = src.marshal(now).to_vec();
        let mut dst = Packet::new(src.mtu());
        dst.buffer_mut()[..wire.len()].copy_from_slice(&wire);
        let r = dst.unmarshal(wire.len(), None, now);
        (dst, r)
    }

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let now = Instant::now();
        let mut p = make_packet(0xDEAD_BEEF, 513, 2, flags::ACK_REQUIRED, b"HELLO WORLD");
        let (q, r) = reparse(&mut p, now);
        r.unwrap();
        assert_eq!(q.chan_id, 0xDEAD_BEEF);
        assert_eq!(q.seq_num, 513);
        assert_eq!(q.gap, 2);
        assert_eq!(q.flags, flags::ACK_REQUIRED);
        assert_eq!(q.version, PACKET_VERSION);
        assert_eq!(q.payload(), b"HELLO WORLD");
        assert_eq!(q.crc16, p.crc16);
        assert_eq!(q.expire_at, None);
    }

    #[test]
    fn header_is_little_endian_on_wire() {
        let now = Instant::now();
        let mut p = make_packet(0x0403_0201, 0x0605, 0x0807, 0x5A, b"");
        let wire = p.marshal(now).to_vec();
        assert_eq!(wire.len(), HEADER_LEN);
        assert_eq!(&wire[OFF_CHAN_ID..OFF_CHAN_ID + 4], &[1, 2, 3, 4]);
        assert_eq!(&wire[OFF_SEQ..OFF_SEQ + 2], &[5, 6]);
        assert_eq!(&wire[OFF_GAP..OFF_GAP + 2], &[7, 8]);
        assert_eq!(wire[OFF_VERSION], PACKET_VERSION);
        assert_eq!(wire[OFF_FLAGS], 0x5A);
        assert_eq!(&wire[OFF_TTL..OFF_TTL + 4], &[0xFF; 4]);
        let crc = u16::from_le_bytes([wire[OFF_CRC], wire[OFF_CRC + 1]]);
        assert_eq!(crc, crc16_update(0, &wire[..OFF_CRC]));
    }

    #[test]
    fn crc_skips_its_own_field_and_ttl_is_not_covered() {
        let now = Instant::now();
        let mut p = make_packet(1, 0, 0, 0, b"xy");
        let wire = p.marshal(now).to_vec();
        let expected = crc16_update(crc16_update(0, &wire[..OFF_CRC]), b"xy");
        assert_eq!(p.crc16, expected);
    }

    #[test]
    fn every_tampered_byte_is_rejected() {
        let now = Instant::now();
        let mut p = make_packet(7, 99, 0, flags::ACK_REQUIRED, b"payload bytes");
        let wire = p.marshal(now).to_vec();
        for i in (0..wire.len()).filter(|i| !(OFF_TTL..OFF_TTL + 4).contains(i)) {
            let mut q = Packet::new(64);
            q.buffer_mut()[..wire.len()].copy_from_slice(&wire);
            q.buffer_mut()[i] ^= 0x10;
            let r = q.unmarshal(wire.len(), None, now);
            assert!(matches!(r, Err(PacketError::BadCrc { .. })), "byte {i} not detected");
            assert_eq!(q.chan_id, 0);
            assert_eq!(q.payload_len(), 0);
        }
    }

    #[test]
    fn short_datagram_is_bad_format() {
        let mut q = Packet::new(64);
        assert_eq!(
            q.unmarshal(HEADER_LEN - 1, None, Instant::now()),
            Err(PacketError::BadFormat(HEADER_LEN - 1))
        );
    }

    #[test]
    fn set_payload_truncates_to_mtu() {
        let mut p = Packet::new(24);
        let n = p.set_payload(b"abcdefghijklmnopqrst");
        assert_eq!(n, 8);
        assert_eq!(p.payload(), b"abcdefgh");
    }

    #[test]
    fn in_place_payload_fill() {
        let mut p = Packet::new(32);
        p.payload_buf_mut()[..3].copy_from_slice(b"abc");
        assert_eq!(p.set_payload_len(3), 3);
        assert_eq!(p.payload(), b"abc");
        assert_eq!(p.set_payload_len(1000), 16);
    }

    #[test]
    fn ttl_translation() {
        let now = Instant::now();
        let mut p = Packet::new(32);

        p.set_ttl(0, now);
        assert_eq!(p.ttl_millis(now), TTL_INFINITE);
        assert!(!p.is_expired(now + Duration::from_secs(3600)));

        p.set_ttl(250, now);
        assert_eq!(p.ttl_millis(now), 250);
        assert_eq!(p.ttl_millis(now + Duration::from_millis(100)), 150);
        assert_eq!(p.ttl_millis(now + Duration::from_millis(300)), 0);
        assert!(p.is_expired(now + Duration::from_millis(250)));
    }

    #[test]
    fn received_ttl_becomes_absolute_expiry() {
        let now = Instant::now();
        let mut p = make_packet(3, 0, 0, 0, b"t");
        p.set_ttl(500, now);
        let (q, r) = reparse(&mut p, now);
        r.unwrap();
        assert_eq!(q.expire_at, Some(now + Duration::from_millis(500)));
    }

    #[test]
    fn past_due_packet_marshals_with_zero_ttl_and_arrives_expired() {
        let now = Instant::now();
        let mut p = make_packet(3, 0, 0, 0, b"late");
        p.set_ttl(10, now);
        let later = now + Duration::from_millis(50);
        let (q, r) = reparse(&mut p, later);
        r.unwrap();
        assert!(q.is_expired(later));
    }

    #[test]
    fn clean_resets_transient_state() {
        let mut p = make_packet(3, 4, 5, flags::ACK_REQUIRED, b"abc");
        p.send_attempts = 4;
        p.fast_retransmit = true;
        p.send_ts = Some(Instant::now());
        p.clean();
        assert_eq!(p.chan_id, 0);
        assert_eq!(p.payload_len(), 0);
        assert_eq!(p.send_attempts, 0);
        assert!(!p.fast_retransmit);
        assert!(p.send_ts.is_none());
    }
}
